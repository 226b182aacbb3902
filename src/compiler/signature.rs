//! Method signatures and their symbol mangling.
//!
//! A signature is a sequence of verb parts, each with an argument count.
//! The mangled form concatenates every part's name followed by one space
//! per argument of that part, so `foo(a, b) else(c)` becomes `"foo  else "`.
//! Arity is therefore part of the name and overload-by-arity falls out of
//! symbol lookup with no extra machinery.

use std::fmt;

/// One verb part of a signature: its name and how many arguments follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignaturePart {
    pub name: String,
    pub arity: u8,
}

/// A complete method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub parts: Vec<SignaturePart>,
}

impl Signature {
    /// A getter or unary operator: bare name, no arguments.
    pub fn getter(name: impl Into<String>) -> Self {
        Self::part(name, 0)
    }

    /// A single-part signature with the given arity. Infix operators are
    /// the one-argument case.
    pub fn part(name: impl Into<String>, arity: u8) -> Self {
        Self {
            parts: vec![SignaturePart {
                name: name.into(),
                arity,
            }],
        }
    }

    /// A setter: `name=` taking exactly one argument.
    pub fn setter(name: impl Into<String>) -> Self {
        Self::part(format!("{}=", name.into()), 1)
    }

    /// A subscript getter with the given index arity.
    pub fn subscript(arity: u8) -> Self {
        Self::part("[", arity)
    }

    /// A subscript setter: index arguments plus the stored value.
    pub fn subscript_setter(index_arity: u8) -> Self {
        Self::part("[=", index_arity + 1)
    }

    /// Append another verb part (`else(...)` continuations).
    pub fn add_part(&mut self, name: impl Into<String>, arity: u8) {
        self.parts.push(SignaturePart {
            name: name.into(),
            arity,
        });
    }

    /// Total argument count across all parts.
    pub fn arity(&self) -> u8 {
        self.parts.iter().map(|part| part.arity).sum()
    }

    /// The mangled symbol name: each part's name followed by one space per
    /// argument.
    pub fn symbol_name(&self) -> String {
        let mut name = String::new();
        for part in &self.parts {
            name.push_str(&part.name);
            for _ in 0..part.arity {
                name.push(' ');
            }
        }
        name
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", part.name)?;
            if part.arity > 0 {
                write!(f, "(")?;
                for arg in 0..part.arity {
                    if arg > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "_")?;
                }
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getter_has_no_spaces() {
        assert_eq!(Signature::getter("count").symbol_name(), "count");
    }

    #[test]
    fn test_one_space_per_argument() {
        assert_eq!(Signature::part("inc", 0).symbol_name(), "inc");
        assert_eq!(Signature::part("add", 1).symbol_name(), "add ");
        assert_eq!(Signature::part("insert", 2).symbol_name(), "insert  ");
    }

    #[test]
    fn test_mixed_fix_mangling() {
        // foo(a, b) else(c) -> "foo  else "
        let mut sig = Signature::part("foo", 2);
        sig.add_part("else", 1);
        assert_eq!(sig.symbol_name(), "foo  else ");
        assert_eq!(sig.arity(), 3);
    }

    #[test]
    fn test_operator_signatures() {
        assert_eq!(Signature::part("+", 1).symbol_name(), "+ ");
        assert_eq!(Signature::getter("-").symbol_name(), "-");
        assert_eq!(Signature::setter("width").symbol_name(), "width= ");
        assert_eq!(Signature::subscript(1).symbol_name(), "[ ");
        assert_eq!(Signature::subscript_setter(1).symbol_name(), "[=  ");
    }

    #[test]
    fn test_arity_disambiguates() {
        // Same verb, different arity, different symbols.
        assert_ne!(
            Signature::part("call", 1).symbol_name(),
            Signature::part("call", 2).symbol_name()
        );
    }

    #[test]
    fn test_display() {
        let mut sig = Signature::part("ifTrue", 1);
        sig.add_part("else", 1);
        assert_eq!(sig.to_string(), "ifTrue(_) else(_)");
    }
}
