// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide value-type registry.
//!
//! Every element type used as a dataflow value registers a fallback value
//! here, together with the type-dispatch entries for constructing empty
//! vectors and filling vectors with the fallback. Fallbacks exist because
//! value types may have default constructors that do no meaningful work,
//! while evaluation still needs well-defined values to substitute for
//! missing data.
//!
//! Reads vastly outnumber writes, so the map sits behind an RW spinlock;
//! the registration barrier separates the construction phase from the
//! query phase.

mod barrier;

use core::any::{Any, TypeId};
use std::sync::OnceLock;

use hashbrown::HashMap;
use vector::{Value, Vector};

pub use barrier::RegistrationBarrier;

/// Identifies a registered value type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeHandle {
    id: TypeId,
    name: &'static str,
}

// === impl TypeHandle ===

impl TypeHandle {
    pub fn of<T: Value>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: core::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

struct Entry {
    fallback: Box<dyn Any + Send + Sync>,
    equals: fn(&dyn Any, &dyn Any) -> bool,
    create_empty: fn() -> Vector,
    fill: fn(&dyn Any, usize, &mut Vector),
    name: &'static str,
}

/// The singleton registry of value types and their fallback values.
pub struct TypeRegistry {
    entries: spin::RwLock<HashMap<TypeId, Entry>>,
    barrier: RegistrationBarrier,
}

static INSTANCE: OnceLock<TypeRegistry> = OnceLock::new();

// === impl TypeRegistry ===

impl TypeRegistry {
    /// The registry instance for querying. Waits until construction-time
    /// registration has finished.
    pub fn instance() -> &'static Self {
        let instance = Self::instance_for_registration();
        instance.barrier.wait_until_fully_constructed();
        instance
    }

    /// The registry instance for registration functions. Does not wait on
    /// the barrier; calling [`TypeRegistry::instance`] from a
    /// registration that runs during construction deadlocks by design.
    pub fn instance_for_registration() -> &'static Self {
        INSTANCE.get_or_init(|| {
            let registry = TypeRegistry {
                entries: spin::RwLock::new(HashMap::new()),
                barrier: RegistrationBarrier::new(),
            };
            registry.register_builtins();
            registry.barrier.set_fully_constructed();
            registry
        })
    }

    /// Registers `T` with the runtime type-dispatch system, using
    /// `fallback` as its substitute for missing data.
    ///
    /// Registering the same type again with an equal fallback is
    /// permitted and idempotent. A differing fallback is a reported
    /// diagnostic; which value wins is unspecified.
    pub fn define<T: Value>(fallback: T) -> TypeHandle {
        Self::instance_for_registration().define_local(fallback)
    }

    /// The registered fallback value for `T`. Unknown types are fatal.
    #[track_caller]
    pub fn fallback<T: Value>(&self) -> T {
        let entries = self.entries.read();
        let entry = entries
            .get(&TypeId::of::<T>())
            .unwrap_or_else(|| unknown_type(core::any::type_name::<T>()));
        entry
            .fallback
            .downcast_ref::<T>()
            .expect("registry entry holds the registered type")
            .clone()
    }

    /// Checks that `T` is registered, returning its handle. Unknown
    /// types are fatal: the intent is to catch missing registrations at
    /// the point where a type is first required.
    #[track_caller]
    pub fn check_registration<T: Value>(&self) -> TypeHandle {
        if !self.entries.read().contains_key(&TypeId::of::<T>()) {
            unknown_type(core::any::type_name::<T>());
        }
        TypeHandle::of::<T>()
    }

    /// Creates an empty (not fallback-filled) vector holding the given
    /// registered type.
    #[track_caller]
    pub fn create_empty_vector(&self, ty: TypeHandle) -> Vector {
        let entries = self.entries.read();
        let entry = entries.get(&ty.id).unwrap_or_else(|| unknown_type(ty.name));
        (entry.create_empty)()
    }

    /// Fills `vector` with `num_elements` copies of the fallback value
    /// registered for `ty`.
    #[track_caller]
    pub fn fill_vector(&self, ty: TypeHandle, num_elements: usize, vector: &mut Vector) {
        let entries = self.entries.read();
        let entry = entries.get(&ty.id).unwrap_or_else(|| unknown_type(ty.name));
        (entry.fill)(entry.fallback.as_ref(), num_elements, vector);
    }

    fn define_local<T: Value>(&self, fallback: T) -> TypeHandle {
        let handle = TypeHandle::of::<T>();
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&handle.id) {
            if !(existing.equals)(existing.fallback.as_ref(), &fallback) {
                log::error!(
                    "type {} registered more than once with different fallback \
                     values",
                    handle.name
                );
            }
            return handle;
        }

        entries.insert(
            handle.id,
            Entry {
                fallback: Box::new(fallback),
                equals: equals_entry::<T>,
                create_empty: Vector::new::<T>,
                fill: fill_entry::<T>,
                name: handle.name,
            },
        );
        handle
    }

    // The scalar types every network can rely on without registering
    // them itself.
    fn register_builtins(&self) {
        self.define_local(false);
        self.define_local(0i32);
        self.define_local(0i64);
        self.define_local(0u32);
        self.define_local(0u64);
        self.define_local(0usize);
        self.define_local(0.0f32);
        self.define_local(0.0f64);
        self.define_local(String::new());
    }
}

#[track_caller]
fn unknown_type(name: &str) -> ! {
    panic!("type {name} has not been registered as an execution value type");
}

fn equals_entry<T: Value>(lhs: &dyn Any, rhs: &dyn Any) -> bool {
    match (lhs.downcast_ref::<T>(), rhs.downcast_ref::<T>()) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        _ => false,
    }
}

fn fill_entry<T: Value>(fallback: &dyn Any, num_elements: usize, vector: &mut Vector) {
    let value = fallback
        .downcast_ref::<T>()
        .expect("registry entry holds the registered type");
    vector.resize::<T>(num_elements);
    let mut rw = vector.read_write::<T>();
    for i in 0..num_elements {
        rw[i] = value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default, PartialEq, Debug)]
    struct Radius(f64);
    impl Value for Radius {}

    #[test]
    fn define_and_query_round_trip() {
        let handle = TypeRegistry::define(Radius(1.5));
        assert_eq!(handle, TypeHandle::of::<Radius>());
        assert_eq!(TypeRegistry::instance().fallback::<Radius>(), Radius(1.5));
        assert_eq!(
            TypeRegistry::instance().check_registration::<Radius>(),
            handle
        );
    }

    #[test]
    fn redefinition_keeps_first_value() {
        #[derive(Clone, Default, PartialEq, Debug)]
        struct Weight(u32);
        impl Value for Weight {}

        TypeRegistry::define(Weight(3));
        // Equal re-registration is idempotent; a differing value is
        // reported and the original wins here.
        TypeRegistry::define(Weight(3));
        TypeRegistry::define(Weight(9));
        assert_eq!(TypeRegistry::instance().fallback::<Weight>(), Weight(3));
    }

    #[test]
    fn builtin_scalars_are_registered() {
        let registry = TypeRegistry::instance();
        assert_eq!(registry.fallback::<f64>(), 0.0);
        assert_eq!(registry.fallback::<i32>(), 0);
        assert!(!registry.fallback::<bool>());
    }

    #[test]
    fn create_empty_vector_dispatch() {
        let registry = TypeRegistry::instance();
        let v = registry.create_empty_vector(TypeHandle::of::<f64>());
        assert!(v.holds::<f64>());
        assert_eq!(v.size(), 0);
    }

    #[test]
    fn fill_vector_dispatch() {
        TypeRegistry::define(Radius(1.5));
        let registry = TypeRegistry::instance();

        let mut v = Vector::new::<Radius>();
        registry.fill_vector(TypeHandle::of::<Radius>(), 6, &mut v);
        assert_eq!(v.size(), 6);
        let a = v.read::<Radius>();
        assert_eq!(a[0], Radius(1.5));
        assert_eq!(a[5], Radius(1.5));
    }

    #[test]
    #[should_panic(expected = "has not been registered")]
    fn unknown_type_is_fatal() {
        #[derive(Clone, Default, PartialEq, Debug)]
        struct Unregistered;
        impl Value for Unregistered {}

        let _ = TypeRegistry::instance().fallback::<Unregistered>();
    }
}
