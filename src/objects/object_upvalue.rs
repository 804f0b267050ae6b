use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// A captured local. While the owning frame is live the upvalue is open:
/// `location` points at the stack slot. Closing copies the slot into
/// `closed` and retargets `location` at that field, so reads and writes
/// go through `location` in both states.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> Self {
        ObjectUpvalue {
            object: Object::new(ObjectType::Upvalue),
            location,
            closed: make_nil_value(),
        }
    }

    pub fn close(&mut self) {
        unsafe {
            self.closed = *self.location;
        }
        self.location = &mut self.closed;
    }

    pub fn is_open(&self) -> bool {
        !std::ptr::eq(self.location, &self.closed)
    }
}
