//! Append-only, bidirectional name ↔ index tables.
//!
//! One VM instance owns one table for method signatures and one for global
//! variable slots; tables are never shared between VMs and never shrink.

use indexmap::IndexSet;

/// An insertion-ordered set of names where each name's index is its symbol.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: IndexSet<String, ahash::RandomState>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its symbol. Existing names keep their
    /// original symbol; the table never stores duplicates.
    pub fn ensure(&mut self, name: &str) -> u16 {
        if let Some(index) = self.names.get_index_of(name) {
            return index as u16;
        }
        let (index, _) = self.names.insert_full(name.to_string());
        assert!(index < u16::MAX as usize, "Too many symbols");
        index as u16
    }

    /// The symbol for a name, if it has been interned.
    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.names.get_index_of(name).map(|index| index as u16)
    }

    /// The name for a symbol.
    pub fn name(&self, symbol: u16) -> Option<&str> {
        self.names.get_index(symbol as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.ensure("toString");
        let b = table.ensure("+ ");
        let c = table.ensure("toString");

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_bidirectional() {
        let mut table = SymbolTable::new();
        let sym = table.ensure("call ");
        assert_eq!(table.name(sym), Some("call "));
        assert_eq!(table.lookup("call "), Some(sym));
        assert_eq!(table.lookup("missing"), None);
    }
}
