//! Kernel objects
//!
//! Every kernel resource is an [`Object`]: a header carrying the refcount and
//! the list of capability slots that reference it, plus the concrete payload
//! in [`ObjectKind`].
//!
//! ## Reference counting
//!
//! The refcount is a *logical* count: one for every slot referencing the
//! object plus one for every outstanding [`ObjRef`] hold. When it drops to
//! zero the object is deinitialized exactly once. `Arc` clones held by
//! kernel bookkeeping (ready queues, connections) keep the memory alive but
//! do not count.

use crate::cap_group::CapGroup;
use crate::connection::Connection;
use crate::notification::Notification;
use crate::pmo::Pmo;
use crate::thread::Thread;
use crate::Kernel;
use core_types::{CapId, CapabilityEvent, ObjectId, ObjectType};
use log::debug;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Back-link from an object to one slot referencing it
#[derive(Debug, Clone)]
pub(crate) struct SlotLink {
    pub cap_group: Weak<Object>,
    pub slot: CapId,
}

impl SlotLink {
    pub fn is(&self, cap_group: &Arc<Object>, slot: CapId) -> bool {
        self.slot == slot && std::ptr::eq(self.cap_group.as_ptr(), Arc::as_ptr(cap_group))
    }
}

/// Concrete payload of an object
pub enum ObjectKind {
    CapGroup(CapGroup),
    Thread(Thread),
    Connection(Connection),
    /// Shared so futex entries can use notifications without a slot
    Notification(Arc<Notification>),
    Pmo(Pmo),
}

impl ObjectKind {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectKind::CapGroup(_) => ObjectType::CapGroup,
            ObjectKind::Thread(_) => ObjectType::Thread,
            ObjectKind::Connection(_) => ObjectType::Connection,
            ObjectKind::Notification(_) => ObjectType::Notification,
            ObjectKind::Pmo(_) => ObjectType::Pmo,
        }
    }
}

/// Object header plus payload
pub struct Object {
    id: ObjectId,
    refcount: AtomicUsize,
    pub(crate) copies: spin::Mutex<Vec<SlotLink>>,
    deinitialized: AtomicBool,
    kind: ObjectKind,
}

impl Object {
    pub(crate) fn new(id: ObjectId, kind: ObjectKind) -> Self {
        Self {
            id,
            refcount: AtomicUsize::new(0),
            copies: spin::Mutex::new(Vec::new()),
            deinitialized: AtomicBool::new(false),
            kind,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn object_type(&self) -> ObjectType {
        self.kind.object_type()
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Current logical refcount (slots + holds)
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Number of slots referencing the object, system-wide
    pub fn copy_count(&self) -> usize {
        self.copies.lock().len()
    }

    pub fn is_deinitialized(&self) -> bool {
        self.deinitialized.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; true if it was the last
    pub(crate) fn put(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("BUG: refcount underflow on {}", self.id);
        }
        prev == 1
    }

    fn mark_deinitialized(&self) -> bool {
        !self.deinitialized.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("type", &self.object_type())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Payload types that can be looked up through a capability
pub trait KernelObject: Sized + 'static {
    const TYPE: ObjectType;

    fn from_kind(kind: &ObjectKind) -> Option<&Self>;
}

macro_rules! kernel_object {
    ($ty:ty, $variant:ident) => {
        impl KernelObject for $ty {
            const TYPE: ObjectType = ObjectType::$variant;

            fn from_kind(kind: &ObjectKind) -> Option<&Self> {
                match kind {
                    ObjectKind::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

kernel_object!(CapGroup, CapGroup);
kernel_object!(Thread, Thread);
kernel_object!(Connection, Connection);
kernel_object!(Pmo, Pmo);

impl KernelObject for Notification {
    const TYPE: ObjectType = ObjectType::Notification;

    fn from_kind(kind: &ObjectKind) -> Option<&Self> {
        match kind {
            ObjectKind::Notification(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

/// Typed, uncounted pointer to an object
///
/// Dereferences to the payload. The type is checked once at construction.
pub struct Handle<T> {
    object: Arc<Object>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: KernelObject> Handle<T> {
    /// Wraps `object` if it has payload type `T`
    pub fn new(object: Arc<Object>) -> Option<Self> {
        T::from_kind(&object.kind)?;
        Some(Self {
            object,
            _kind: PhantomData,
        })
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<T: KernelObject> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match T::from_kind(&self.object.kind) {
            Some(inner) => inner,
            None => unreachable!("handle type is checked at construction"),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            _kind: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({} {})", self.object.object_type(), self.object.id)
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl<T> Eq for Handle<T> {}

/// Counted hold on an object, released on drop
pub struct ObjRef<'k, T: KernelObject> {
    kernel: &'k Kernel,
    handle: Handle<T>,
    released: bool,
}

impl<'k, T: KernelObject> ObjRef<'k, T> {
    /// Wraps a hold already accounted for in the refcount
    pub(crate) fn adopt(kernel: &'k Kernel, handle: Handle<T>) -> Self {
        Self {
            kernel,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &Handle<T> {
        &self.handle
    }

    /// Ends RAII tracking but keeps the hold
    ///
    /// The caller becomes responsible for a matching [`Kernel::obj_put`].
    pub(crate) fn keep(mut self) -> Handle<T> {
        self.released = true;
        self.handle.clone()
    }
}

impl<T: KernelObject> Deref for ObjRef<'_, T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Handle<T> {
        &self.handle
    }
}

impl<T: KernelObject> Drop for ObjRef<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.kernel.obj_put(self.handle.object());
        }
    }
}

impl Kernel {
    /// Allocates an object with refcount 0
    pub fn obj_alloc(&self, kind: ObjectKind) -> Arc<Object> {
        let id = ObjectId::from_raw(self.next_object_id.fetch_add(1, Ordering::Relaxed));
        debug!("obj_alloc: {} {}", kind.object_type(), id);
        Arc::new(Object::new(id, kind))
    }

    /// Discards an object no capability was ever created for
    pub fn obj_free(&self, object: Arc<Object>) {
        if object.refcount() != 0 {
            panic!("BUG: obj_free on referenced {}", object.id());
        }
        debug!("obj_free: {} {}", object.object_type(), object.id());
        drop(object);
    }

    /// Releases one reference and deinitializes the object on the last one
    pub fn obj_put(&self, object: &Arc<Object>) {
        if object.put() {
            self.obj_deinit(object);
        }
    }

    fn obj_deinit(&self, object: &Arc<Object>) {
        if !object.mark_deinitialized() {
            panic!("BUG: {} deinitialized twice", object.id());
        }
        debug!("obj_deinit: {} {}", object.object_type(), object.id());
        match object.kind() {
            ObjectKind::CapGroup(group) => self.cap_group_deinit(object, group),
            ObjectKind::Thread(thread) => self.thread_deinit(object, thread),
            ObjectKind::Connection(conn) => conn.deinit(),
            ObjectKind::Notification(notifc) => notifc.deinit(),
            ObjectKind::Pmo(_) => {}
        }
        self.record_cap_event(CapabilityEvent::Deinitialized {
            object: object.id(),
            object_type: object.object_type(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::boot_kernel;

    #[test]
    fn test_handle_type_checked() {
        let kernel = boot_kernel(1);
        let object = kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(64)));
        assert!(Handle::<Pmo>::new(Arc::clone(&object)).is_some());
        assert!(Handle::<Thread>::new(object).is_none());
    }

    #[test]
    fn test_object_ids_are_unique() {
        let kernel = boot_kernel(1);
        let a = kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(8)));
        let b = kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(8)));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.refcount(), 0);
        kernel.obj_free(a);
        kernel.obj_free(b);
    }

    #[test]
    fn test_last_put_deinitializes_once() {
        let kernel = boot_kernel(1);
        let object = kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(8)));
        object.get();
        object.get();
        kernel.obj_put(&object);
        assert!(!object.is_deinitialized());
        kernel.obj_put(&object);
        assert!(object.is_deinitialized());

        let deinits = kernel.capability_audit().count_events(|e| {
            matches!(e, CapabilityEvent::Deinitialized { object: id, .. } if *id == object.id())
        });
        assert_eq!(deinits, 1);
    }

    #[test]
    #[should_panic(expected = "BUG")]
    fn test_obj_free_rejects_referenced_object() {
        let kernel = boot_kernel(1);
        let object = kernel.obj_alloc(ObjectKind::Pmo(Pmo::new(8)));
        object.get();
        kernel.obj_free(object);
    }
}
