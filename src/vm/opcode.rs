//! Bytecode instruction definitions for the Tern VM.

/// Opcodes for the bytecode virtual machine.
///
/// Call opcodes encode the argument count in the opcode itself; the u16
/// operand is the method symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // ============ Constants & Stack ============
    /// Load a constant from the constant pool: CONSTANT <index:u16>
    Constant = 0,
    /// Push nil onto the stack
    Nil,
    /// Push true onto the stack
    True,
    /// Push false onto the stack
    False,
    /// Pop the top value from the stack
    Pop,
    /// Duplicate the top value on the stack
    Dup,

    // ============ Variables ============
    /// Load a local slot relative to the frame base: LOAD_LOCAL <slot:u8>
    LoadLocal,
    /// Store into a local slot (value stays on the stack): STORE_LOCAL <slot:u8>
    StoreLocal,
    /// Load a captured variable: LOAD_UPVALUE <index:u8>
    LoadUpvalue,
    /// Store into a captured variable: STORE_UPVALUE <index:u8>
    StoreUpvalue,
    /// Load a global slot: LOAD_GLOBAL <slot:u16>
    LoadGlobal,
    /// Store into a global slot: STORE_GLOBAL <slot:u16>
    StoreGlobal,
    /// Load a field of the receiver in frame slot 0: LOAD_FIELD <index:u8>
    LoadField,
    /// Store into a field of the receiver: STORE_FIELD <index:u8>
    StoreField,

    // ============ Literals ============
    /// Build a list from the top N stack values: BUILD_LIST <count:u8>
    BuildList,
    /// Build a map from the top N key/value pairs: BUILD_MAP <pair_count:u8>
    BuildMap,

    // ============ Control Flow ============
    /// Unconditional forward jump: JUMP <offset:u16>
    Jump,
    /// Pop the condition and jump forward if it is falsey: JUMP_IF <offset:u16>
    JumpIf,
    /// Short-circuit &&: jump if falsey keeping the value, else pop: AND <offset:u16>
    And,
    /// Short-circuit ||: jump if truthy keeping the value, else pop: OR <offset:u16>
    Or,
    /// Backward jump: LOOP <offset:u16>
    Loop,

    // ============ Calls ============
    /// Invoke a method with N arguments: CALL_N <symbol:u16>.
    /// The receiver sits below the arguments on the stack.
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,

    // ============ Closures ============
    /// Create a closure: CLOSURE <fn_index:u16> then one (is_local, index)
    /// byte pair per captured upvalue.
    Closure,
    /// Close the upvalue for the top stack slot and pop it
    CloseUpvalue,

    // ============ Classes ============
    /// Create a class with Object as superclass: CLASS <num_fields:u8>.
    /// Pops the class name, pushes the class.
    Class,
    /// Create a class from an explicit superclass: SUBCLASS <num_fields:u8>.
    /// Pops the superclass then the name, pushes the class.
    Subclass,
    /// Bind the method closure on the stack top to the class below it:
    /// METHOD <symbol:u16>
    Method,
    /// Bind a static method on the class's metaclass: STATIC_METHOD <symbol:u16>
    StaticMethod,
    /// Replace the class in frame slot 0 with a fresh instance of it
    Construct,

    // ============ Type test ============
    /// Pop a class and a value, push whether the value's class chain
    /// contains the class
    Is,

    // ============ Frames ============
    /// Pop the current call frame; an empty frame stack completes the fiber
    End,
}

/// Calls may not pass more than this many arguments; the argument count is
/// encoded in the opcode.
pub const MAX_CALL_ARGS: usize = 8;

impl OpCode {
    /// The call opcode for a given argument count.
    pub fn call(arg_count: usize) -> OpCode {
        debug_assert!(arg_count <= MAX_CALL_ARGS);
        let base = OpCode::Call0 as u8;
        // Call0..Call8 are contiguous.
        OpCode::from_u8(base + arg_count as u8).unwrap_or(OpCode::Call8)
    }

    /// The argument count for a call opcode, if this is one.
    pub fn call_args(self) -> Option<usize> {
        let op = self as u8;
        let base = OpCode::Call0 as u8;
        if (base..=OpCode::Call8 as u8).contains(&op) {
            Some((op - base) as usize)
        } else {
            None
        }
    }

    /// The number of fixed operand bytes for this opcode. `Closure` carries
    /// additional capture byte pairs determined by the function it loads.
    pub fn operand_size(self) -> usize {
        match self {
            OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::Dup
            | OpCode::CloseUpvalue
            | OpCode::Construct
            | OpCode::Is
            | OpCode::End => 0,

            OpCode::LoadLocal
            | OpCode::StoreLocal
            | OpCode::LoadUpvalue
            | OpCode::StoreUpvalue
            | OpCode::LoadField
            | OpCode::StoreField
            | OpCode::BuildList
            | OpCode::BuildMap
            | OpCode::Class
            | OpCode::Subclass => 1,

            OpCode::Constant
            | OpCode::LoadGlobal
            | OpCode::StoreGlobal
            | OpCode::Jump
            | OpCode::JumpIf
            | OpCode::And
            | OpCode::Or
            | OpCode::Loop
            | OpCode::Call0
            | OpCode::Call1
            | OpCode::Call2
            | OpCode::Call3
            | OpCode::Call4
            | OpCode::Call5
            | OpCode::Call6
            | OpCode::Call7
            | OpCode::Call8
            | OpCode::Closure
            | OpCode::Method
            | OpCode::StaticMethod => 2,
        }
    }

    /// Convert from u8 to OpCode.
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        if byte <= OpCode::End as u8 {
            Some(unsafe { std::mem::transmute::<u8, OpCode>(byte) })
        } else {
            None
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for i in 0..=OpCode::End as u8 {
            let op = OpCode::from_u8(i).expect("valid opcode");
            assert_eq!(i, op as u8);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(OpCode::from_u8(255).is_none());
    }

    #[test]
    fn test_call_encoding() {
        assert_eq!(OpCode::call(0), OpCode::Call0);
        assert_eq!(OpCode::call(8), OpCode::Call8);
        assert_eq!(OpCode::Call3.call_args(), Some(3));
        assert_eq!(OpCode::Constant.call_args(), None);
    }
}
