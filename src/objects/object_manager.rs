use std::collections::HashMap;

use crate::objects::{
    object::Object,
    object_closure::ObjectClosure,
    object_coroutine::ObjectCoroutine,
    object_dict::ObjectDict,
    object_function::ObjectFunction,
    object_list::ObjectList,
    object_native_function::{NativeFn, ObjectNativeFunction},
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};
use crate::table::Table;
use crate::value::{as_object, make_object_value, Value};

/// Owns the global object list. Every live object appears here exactly
/// once from allocation until the sweep that frees it.
pub struct ObjectManager {
    objects: Vec<*mut Object>,
    // Bytes allocated since the last drain (deep size at allocation time).
    pending_bytes: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        ObjectManager {
            objects: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Drain and return bytes allocated since the last call.
    pub fn drain_pending_bytes(&mut self) -> usize {
        let bytes = self.pending_bytes;
        self.pending_bytes = 0;
        bytes
    }

    fn push_object(&mut self, object: *mut Object) -> usize {
        let size = unsafe { (*object).deep_size() };
        self.pending_bytes += size;
        self.objects.push(object);
        size
    }

    pub fn alloc_string(&mut self, content: String) -> (*mut ObjectString, usize) {
        let ptr = Box::into_raw(Box::new(ObjectString::new(content)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    /// Intern lookup with borrow semantics: the text is duplicated only on
    /// an intern miss.
    pub fn intern_copy(&mut self, strings: &mut Table, text: &str) -> *mut ObjectString {
        if let Some(existing) = strings.find(text) {
            return as_object(&existing) as *mut ObjectString;
        }
        let (ptr, _) = self.alloc_string(text.to_string());
        strings.insert(text.to_string(), make_object_value(ptr as *mut Object));
        ptr
    }

    /// Intern lookup with ownership transfer: the buffer is dropped when
    /// an equal string is already interned.
    pub fn intern_take(&mut self, strings: &mut Table, text: String) -> *mut ObjectString {
        if let Some(existing) = strings.find(&text) {
            return as_object(&existing) as *mut ObjectString;
        }
        let key = text.clone();
        let (ptr, _) = self.alloc_string(text);
        strings.insert(key, make_object_value(ptr as *mut Object));
        ptr
    }

    pub fn adopt_function(&mut self, function: Box<ObjectFunction>) -> (*mut ObjectFunction, usize) {
        let ptr = Box::into_raw(function);
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> (*mut ObjectClosure, usize) {
        let ptr = Box::into_raw(Box::new(ObjectClosure::new(function)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> (*mut ObjectUpvalue, usize) {
        let ptr = Box::into_raw(Box::new(ObjectUpvalue::new(location)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_list(&mut self, elements: Vec<Value>) -> (*mut ObjectList, usize) {
        let ptr = Box::into_raw(Box::new(ObjectList::new(elements)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_dict(
        &mut self,
        entries: HashMap<*mut ObjectString, Value>,
    ) -> (*mut ObjectDict, usize) {
        let ptr = Box::into_raw(Box::new(ObjectDict::new(entries)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_native(
        &mut self,
        name: String,
        arity: i32,
        function: NativeFn,
    ) -> (*mut ObjectNativeFunction, usize) {
        let ptr = Box::into_raw(Box::new(ObjectNativeFunction::new(name, arity, function)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    pub fn alloc_coroutine(&mut self, closure: *mut ObjectClosure) -> (*mut ObjectCoroutine, usize) {
        let ptr = Box::into_raw(Box::new(ObjectCoroutine::new(closure)));
        let size = self.push_object(ptr as *mut Object);
        (ptr, size)
    }

    /// Iterate over all managed objects (for GC mark/sweep and tests).
    pub fn iter(&self) -> impl Iterator<Item = &*mut Object> {
        self.objects.iter()
    }

    pub fn live_count(&self) -> usize {
        self.objects.len()
    }

    /// Free every unmarked object, clear the mark on the survivors, and
    /// return the number of bytes released.
    pub fn sweep_unmarked(&mut self) -> usize {
        let mut freed_bytes = 0;
        self.objects.retain(|&ptr| unsafe {
            if (*ptr).marked {
                (*ptr).marked = false;
                true
            } else {
                freed_bytes += (*ptr).deep_size();
                free_object(ptr);
                false
            }
        });
        freed_bytes
    }

    /// Deallocate all objects (VM teardown).
    pub unsafe fn free_all(&mut self) {
        for &ptr in &self.objects {
            free_object(ptr);
        }
        self.objects.clear();
    }
}

/// Reconstitute the concrete box so owned buffers are released.
unsafe fn free_object(ptr: *mut Object) {
    use crate::objects::object::ObjectType;
    match (*ptr).obj_type {
        ObjectType::String => drop(Box::from_raw(ptr as *mut ObjectString)),
        ObjectType::Function => drop(Box::from_raw(ptr as *mut ObjectFunction)),
        ObjectType::Closure => drop(Box::from_raw(ptr as *mut ObjectClosure)),
        ObjectType::Upvalue => drop(Box::from_raw(ptr as *mut ObjectUpvalue)),
        ObjectType::List => drop(Box::from_raw(ptr as *mut ObjectList)),
        ObjectType::Dict => drop(Box::from_raw(ptr as *mut ObjectDict)),
        ObjectType::Native => drop(Box::from_raw(ptr as *mut ObjectNativeFunction)),
        ObjectType::Coroutine => drop(Box::from_raw(ptr as *mut ObjectCoroutine)),
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        unsafe {
            self.free_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_pointer() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        let first = manager.intern_copy(&mut strings, "shared");
        let second = manager.intern_copy(&mut strings, "shared");
        let third = manager.intern_take(&mut strings, "shared".to_string());
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(strings.len(), 1);
        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn allocation_tracks_pending_bytes() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        manager.intern_copy(&mut strings, "bytes");
        assert!(manager.drain_pending_bytes() > 0);
        assert_eq!(manager.drain_pending_bytes(), 0);
    }

    #[test]
    fn sweep_frees_unmarked_objects() {
        let mut manager = ObjectManager::new();
        let (kept, _) = manager.alloc_string("kept".to_string());
        let (_dropped, _) = manager.alloc_string("dropped".to_string());
        unsafe {
            (*kept).object.marked = true;
        }
        let freed = manager.sweep_unmarked();
        assert!(freed > 0);
        assert_eq!(manager.live_count(), 1);
        unsafe {
            assert!(!(*kept).object.marked);
        }
    }
}
