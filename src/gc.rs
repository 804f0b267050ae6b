use crate::objects::{
    object::{Object, ObjectType},
    object_coroutine::ObjectCoroutine,
    object_function::ObjectFunction,
    object_manager::ObjectManager,
};
use crate::table::Table;
use crate::value::{as_object, is_object, Value};
use crate::vm::ExecutionContext;

/// Aggregated GC statistics (currently-live bytes are tracked by the VM).
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GcStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the debug_log_gc feature).
#[cfg(feature = "debug_log_gc")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "debug_log_gc"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

/// Tri-color precise mark-sweep. White objects carry a clear mark bit,
/// gray objects sit on the worklist, black objects are marked and off the
/// worklist. Sweeping clears the mark on every survivor.
pub struct GarbageCollector {
    gray_stack: Vec<*mut Object>,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        GarbageCollector {
            gray_stack: Vec::new(),
            stats: GcStats::default(),
        }
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).marked {
                return;
            }
            (*object).marked = true;
        }
        gc_trace!("mark {:p}", object);
        self.gray_stack.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    fn mark_table(&mut self, table: &Table) {
        for (_, value) in table.iter() {
            self.mark_value(value);
        }
    }

    fn mark_context(&mut self, context: &ExecutionContext) {
        for value in &context.stack {
            self.mark_value(value);
        }
        for frame in &context.frames {
            self.mark_object(frame.closure as *mut Object);
        }
        for &upvalue in &context.open_upvalues {
            self.mark_object(upvalue as *mut Object);
        }
    }

    /// Gather every root: the active context, the globals table, the
    /// current coroutine (whose saved-caller chain holds every suspended
    /// awaiter), and any functions still under compilation. Interned
    /// strings are weak and deliberately not treated as roots.
    pub fn mark_roots(
        &mut self,
        context: &ExecutionContext,
        globals: &Table,
        current_coroutine: *mut ObjectCoroutine,
        compiler_functions: &[*mut ObjectFunction],
    ) {
        self.mark_context(context);
        self.mark_table(globals);
        self.mark_object(current_coroutine as *mut Object);
        for &function in compiler_functions {
            self.mark_object(function as *mut Object);
        }
    }

    /// Drain the gray worklist, blackening one object at a time.
    pub fn trace_references(&mut self) {
        while let Some(object) = self.gray_stack.pop() {
            gc_trace!("blacken {:p}", object);
            unsafe {
                self.blacken_object(object);
            }
        }
    }

    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::String | ObjectType::Native => {}
            ObjectType::Function => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectType::Closure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::Upvalue => {
                let upvalue = (*object).as_upvalue();
                self.mark_value(&*upvalue.location);
            }
            ObjectType::List => {
                let list = (*object).as_list();
                for element in &list.elements {
                    self.mark_value(element);
                }
            }
            ObjectType::Dict => {
                let dict = (*object).as_dict();
                for (&key, value) in &dict.entries {
                    self.mark_object(key as *mut Object);
                    self.mark_value(value);
                }
            }
            ObjectType::Coroutine => {
                let coroutine = &*(object as *mut ObjectCoroutine);
                self.blacken_coroutine(coroutine);
            }
        }
    }

    unsafe fn blacken_coroutine(&mut self, coroutine: &ObjectCoroutine) {
        self.mark_object(coroutine.closure as *mut Object);
        self.mark_value(&coroutine.resume_value);
        for value in &coroutine.stack {
            self.mark_value(value);
        }
        for frame in &coroutine.frames {
            self.mark_object(frame.closure as *mut Object);
        }
        for &upvalue in &coroutine.open_upvalues {
            self.mark_object(upvalue as *mut Object);
        }
        if let Some(caller) = &coroutine.resumed_by {
            for value in &caller.stack {
                self.mark_value(value);
            }
            for frame in &caller.frames {
                self.mark_object(frame.closure as *mut Object);
            }
            for &upvalue in &caller.open_upvalues {
                self.mark_object(upvalue as *mut Object);
            }
            self.mark_object(caller.coroutine as *mut Object);
        }
    }

    /// The intern set holds weak references: once tracing is complete,
    /// entries whose string was never marked are dropped so the set does
    /// not keep dead strings alive.
    pub fn prune_interned(&mut self, strings: &mut Table) {
        strings.retain(|_, value| unsafe { (*as_object(value)).marked });
    }

    pub fn sweep(&mut self, manager: &mut ObjectManager) -> usize {
        let freed = manager.sweep_unmarked();
        gc_trace!("sweep freed {} bytes", freed);
        freed
    }

    /// Record a completed cycle (the VM knows bytes before/after and the
    /// next trigger threshold).
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle {} freed={} before={} after={} next={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_object_value;
    use crate::vm::ExecutionContext;

    fn collect(
        gc: &mut GarbageCollector,
        manager: &mut ObjectManager,
        context: &ExecutionContext,
        globals: &Table,
        strings: &mut Table,
    ) -> usize {
        gc.mark_roots(context, globals, std::ptr::null_mut(), &[]);
        gc.trace_references();
        gc.prune_interned(strings);
        gc.sweep(manager)
    }

    #[test]
    fn collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        let (kept, _) = manager.alloc_string("kept".to_string());
        manager.alloc_string("dropped1".to_string());
        manager.alloc_string("dropped2".to_string());

        let mut context = ExecutionContext::new();
        context.stack.push(make_object_value(kept as *mut Object));
        let globals = Table::new();
        let mut strings = Table::new();

        let mut gc = GarbageCollector::new();
        let freed = collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        assert!(freed > 0);
        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn keeps_closure_and_its_function() {
        let mut manager = ObjectManager::new();
        let function = Box::new(ObjectFunction::new(Some("kept".to_string())));
        let (function_ptr, _) = manager.adopt_function(function);
        let (closure, _) = manager.alloc_closure(function_ptr);
        manager.adopt_function(Box::new(ObjectFunction::new(Some("dead".to_string()))));

        let mut context = ExecutionContext::new();
        context
            .stack
            .push(make_object_value(closure as *mut Object));
        let globals = Table::new();
        let mut strings = Table::new();

        let mut gc = GarbageCollector::new();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        assert_eq!(manager.live_count(), 2);
    }

    #[test]
    fn marks_through_open_upvalues() {
        let mut manager = ObjectManager::new();
        let (captured, _) = manager.alloc_string("captured".to_string());

        let mut context = ExecutionContext::new();
        context
            .stack
            .push(make_object_value(captured as *mut Object));
        let slot = &mut context.stack[0] as *mut Value;
        let (upvalue, _) = manager.alloc_upvalue(slot);
        context.open_upvalues.push(upvalue);
        // Clear the stack so only the upvalue keeps the string alive.
        context.stack.clear();

        let globals = Table::new();
        let mut strings = Table::new();
        let mut gc = GarbageCollector::new();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        assert_eq!(manager.live_count(), 2);
    }

    #[test]
    fn intern_entries_are_weak() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        manager.intern_copy(&mut strings, "unreferenced");
        assert_eq!(strings.len(), 1);

        let context = ExecutionContext::new();
        let globals = Table::new();
        let mut gc = GarbageCollector::new();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        assert_eq!(strings.len(), 0);
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn survivors_end_a_cycle_unmarked() {
        let mut manager = ObjectManager::new();
        let (kept, _) = manager.alloc_string("kept".to_string());
        let mut context = ExecutionContext::new();
        context.stack.push(make_object_value(kept as *mut Object));
        let globals = Table::new();
        let mut strings = Table::new();

        let mut gc = GarbageCollector::new();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        for &object in manager.iter() {
            unsafe {
                assert!(!(*object).marked);
            }
        }
    }

    #[test]
    fn idle_cycles_preserve_reachability() {
        let mut manager = ObjectManager::new();
        let (kept, _) = manager.alloc_string("kept".to_string());
        let mut context = ExecutionContext::new();
        context.stack.push(make_object_value(kept as *mut Object));
        let globals = Table::new();
        let mut strings = Table::new();

        let mut gc = GarbageCollector::new();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        let after_first = manager.live_count();
        collect(&mut gc, &mut manager, &context, &globals, &mut strings);
        assert_eq!(manager.live_count(), after_first);
    }

    #[test]
    fn stats_record_cycles() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
