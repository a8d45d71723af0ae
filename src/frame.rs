//! Stack frames for method execution.
use crate::errors::VmError;
use crate::heap::{Reference, Value};

/// Runtime record for one active method invocation. Each frame owns an
/// operand stack, a fixed table of local variables and the program counter
/// into the method's code.
#[derive(Debug)]
pub struct Frame {
    pub pc: usize,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

impl Frame {
    pub fn new(max_stack: usize, max_locals: usize) -> Self {
        Self {
            pc: 0,
            stack: Vec::with_capacity(max_stack),
            locals: vec![Value::Null; max_locals],
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pop the top of the stack, which must be an int.
    pub fn pop_int(&mut self) -> Result<i32, VmError> {
        match self.pop()? {
            Value::Int(value) => Ok(value),
            _ => Err(VmError::ExpectedInt),
        }
    }

    /// Pop the top of the stack, which must be a reference or null.
    pub fn pop_ref(&mut self) -> Result<Option<Reference>, VmError> {
        match self.pop()? {
            Value::Ref(reference) => Ok(Some(reference)),
            Value::Null => Ok(None),
            Value::Int(_) => Err(VmError::ExpectedReference),
        }
    }

    pub fn top(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    /// Copy the top of the stack back onto the stack.
    pub fn dup_top(&mut self) -> Result<(), VmError> {
        let top = self.top()?.clone();
        self.push(top);
        Ok(())
    }

    /// First reference found scanning down from the top of the stack after
    /// skipping `skip` slots. Invocation handlers use this to locate the
    /// receiver, which sits below the pushed arguments.
    pub fn peek_ref(&self, skip: usize) -> Result<Reference, VmError> {
        self.stack
            .iter()
            .rev()
            .skip(skip)
            .find_map(|value| match value {
                Value::Ref(reference) => Some(reference.clone()),
                _ => None,
            })
            .ok_or(VmError::ExpectedReference)
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn load_local(&self, index: usize) -> Result<Value, VmError> {
        self.locals
            .get(index)
            .cloned()
            .ok_or(VmError::BadLocal(index))
    }

    pub fn store_local(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::BadLocal(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{new_array, ELEM_INT};

    #[test]
    fn push_then_pop_returns_the_same_value() {
        let mut frame = Frame::new(8, 0);
        let samples = vec![
            Value::Int(0),
            Value::Int(-1),
            Value::Int(i32::MAX),
            Value::Null,
            Value::Ref(new_array(1, ELEM_INT)),
        ];
        for value in samples {
            frame.push(value.clone());
            assert_eq!(frame.pop().unwrap(), value);
        }
        assert!(matches!(frame.pop(), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn typed_pops_reject_mismatches() {
        let mut frame = Frame::new(4, 0);
        frame.push(Value::Null);
        assert!(matches!(frame.pop_int(), Err(VmError::ExpectedInt)));
        frame.push(Value::Int(7));
        assert!(matches!(frame.pop_ref(), Err(VmError::ExpectedReference)));
    }

    #[test]
    fn pop_ref_accepts_null() {
        let mut frame = Frame::new(4, 0);
        frame.push(Value::Null);
        assert!(frame.pop_ref().unwrap().is_none());
    }

    #[test]
    fn peek_ref_skips_argument_slots() {
        let mut frame = Frame::new(8, 0);
        let receiver = new_array(1, ELEM_INT);
        let shadow = new_array(1, ELEM_INT);
        frame.push(Value::Ref(receiver.clone()));
        frame.push(Value::Ref(shadow));
        frame.push(Value::Int(1));
        frame.push(Value::Int(2));
        // Two int arguments sit above the receiver; the reference directly
        // above the receiver must not win once the args are skipped.
        let found = frame.peek_ref(3).unwrap();
        assert!(Reference::ptr_eq(&found, &receiver));
        // Without skipping, the topmost reference wins.
        let top = frame.peek_ref(0).unwrap();
        assert!(!Reference::ptr_eq(&top, &receiver));
    }

    #[test]
    fn locals_are_bounds_checked() {
        let mut frame = Frame::new(0, 2);
        frame.store_local(1, Value::Int(9)).unwrap();
        assert_eq!(frame.load_local(1).unwrap(), Value::Int(9));
        assert_eq!(frame.load_local(0).unwrap(), Value::Null);
        assert!(matches!(frame.load_local(2), Err(VmError::BadLocal(2))));
        assert!(matches!(
            frame.store_local(5, Value::Null),
            Err(VmError::BadLocal(5))
        ));
    }
}
