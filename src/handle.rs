//! Opaque-handle machinery for objects that exclusively own one native resource.
//!
//! A [Handle] is a slot holding a raw pointer into the token runtime. The slot is
//! cleared to the null sentinel when the pointer is extracted for destruction, so
//! a second destruction of the same resource is structurally unrepresentable: the
//! authoritative teardown path reads the slot exactly once.

pub mod generic {
  use parking_lot::RwLock;

  use std::mem;
  use std::ptr;
  use std::sync::Arc;

  pub type ConstPointer<T> = *const T;
  pub type Pointer<T> = *mut T;

  /// Slot for an exclusively owned native pointer.
  ///
  /// Invariant: the slot is non-null from construction until [Handle::take], and
  /// null forever after. Callers observing null must treat the resource as gone.
  #[derive(Debug)]
  pub struct Handle<T> {
    inner: Arc<RwLock<Pointer<T>>>,
  }
  unsafe impl<T> Send for Handle<T> {}
  unsafe impl<T> Sync for Handle<T> {}

  impl<T> Handle<T> {
    pub fn new(p: Pointer<T>) -> Self {
      Self {
        inner: Arc::new(RwLock::new(p)),
      }
    }

    /// Read the stored pointer without transferring ownership. Null after
    /// [Handle::take].
    pub fn get_ptr(&self) -> Pointer<T> {
      *self.inner.read()
    }

    /// Extract the pointer, leaving the null sentinel behind. At most one call
    /// observes the live pointer.
    pub fn take(&mut self) -> Pointer<T> {
      let mut slot = self.inner.write();
      mem::replace(&mut *slot, ptr::null_mut())
    }

    pub fn is_cleared(&self) -> bool {
      self.inner.read().is_null()
    }
  }
}

pub mod handled {
  use super::generic::*;

  use std::convert::{AsMut, AsRef};

  /// Destruction entry point for one native struct type.
  pub trait Destroyed<StructType> {
    unsafe fn destroy_raw(t: Pointer<StructType>);
  }

  /// Creation entry point: turn a request `I` into a freshly allocated native
  /// resource, or an error with nothing left allocated.
  pub trait Managed<StructType, I, E> {
    unsafe fn create_raw(i: I) -> Result<Pointer<StructType>, E>;

    unsafe fn create_new_handle(i: I) -> Result<Handle<StructType>, E> {
      let p = Self::create_raw(i)?;
      Ok(Handle::new(p))
    }
  }

  pub trait ViaHandle<StructType>: AsRef<Handle<StructType>> + AsMut<Handle<StructType>> {
    fn from_handle(handle: Handle<StructType>) -> Self;
  }

  /// A managed object owning exactly one native resource for its whole lifetime.
  ///
  /// [Handled::handled_instance] is the wrap operation: ownership of the created
  /// pointer moves straight into the returned proxy, so no caller is ever left
  /// holding a second copy of a live pointer.
  pub trait Handled<StructType, I, E>:
    Managed<StructType, I, E> + Destroyed<StructType> + ViaHandle<StructType>
  {
    fn handled_instance(i: I) -> Result<Self, E>
    where
      Self: Sized,
    {
      let handle = unsafe { Self::create_new_handle(i)? };
      Ok(Self::from_handle(handle))
    }

    /// Destroy the native resource if this proxy still owns one and clear the
    /// slot. Idempotent: a second call observes the null sentinel and does
    /// nothing.
    fn release_native_resources(&mut self) {
      let native = self.as_mut().take();
      if !native.is_null() {
        unsafe { Self::destroy_raw(native) };
      }
    }
  }
}

pub use generic::*;
pub use handled::*;

#[cfg(test)]
mod test {
  use super::*;

  use std::convert::{AsMut, AsRef};
  use std::sync::atomic::{AtomicUsize, Ordering};

  static DESTROYED: AtomicUsize = AtomicUsize::new(0);

  struct NativeThing {
    _payload: u64,
  }

  struct ThingProxy {
    handle: Handle<NativeThing>,
  }

  impl AsRef<Handle<NativeThing>> for ThingProxy {
    fn as_ref(&self) -> &Handle<NativeThing> {
      &self.handle
    }
  }
  impl AsMut<Handle<NativeThing>> for ThingProxy {
    fn as_mut(&mut self) -> &mut Handle<NativeThing> {
      &mut self.handle
    }
  }
  impl ViaHandle<NativeThing> for ThingProxy {
    fn from_handle(handle: Handle<NativeThing>) -> Self {
      Self { handle }
    }
  }
  impl Destroyed<NativeThing> for ThingProxy {
    unsafe fn destroy_raw(t: Pointer<NativeThing>) {
      drop(Box::from_raw(t));
      DESTROYED.fetch_add(1, Ordering::SeqCst);
    }
  }
  impl Managed<NativeThing, u64, ()> for ThingProxy {
    unsafe fn create_raw(i: u64) -> Result<Pointer<NativeThing>, ()> {
      Ok(Box::into_raw(Box::new(NativeThing { _payload: i })))
    }
  }
  impl Handled<NativeThing, u64, ()> for ThingProxy {}

  #[test]
  fn release_is_idempotent() {
    let before = DESTROYED.load(Ordering::SeqCst);
    let mut proxy = ThingProxy::handled_instance(42).unwrap();
    assert!(!proxy.handle.is_cleared());

    proxy.release_native_resources();
    assert!(proxy.handle.is_cleared());
    assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);

    proxy.release_native_resources();
    assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
  }

  #[test]
  fn take_clears_the_slot_exactly_once() {
    let mut proxy = ThingProxy::handled_instance(7).unwrap();
    let p = proxy.handle.take();
    assert!(!p.is_null());
    assert!(proxy.handle.take().is_null());
    unsafe { ThingProxy::destroy_raw(p) };
  }
}
