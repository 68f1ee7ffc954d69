/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Values stored in [`Attributes`] must be debuggable so that resolver
/// updates remain printable.
trait AttributeTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + Debug> AttributeTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }
}

/// An immutable, cheaply cloneable collection of values keyed by their type.
///
/// Resolvers use attributes to attach data to endpoints and addresses that is
/// meaningful only to particular LB policies, e.g. opting an endpoint out of
/// outlier detection.
#[derive(Clone, Default)]
pub struct Attributes {
    map: Arc<BTreeMap<TypeId, Arc<dyn AttributeTrait>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new Attributes object with the value added.  If a value of
    /// the same type already exists, it is replaced.
    pub fn add<T: Any + Send + Sync + Debug>(&self, value: T) -> Self {
        let mut map = (*self.map).clone();
        map.insert(TypeId::of::<T>(), Arc::new(value));
        Attributes { map: Arc::new(map) }
    }

    /// Gets a reference to the value of type T, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| (**v).any_ref().downcast_ref())
    }

    /// Returns a new Attributes object with the value of type T removed.
    pub fn remove<T: 'static>(&self) -> Self {
        let mut map = (*self.map).clone();
        map.remove(&TypeId::of::<T>());
        Attributes { map: Arc::new(map) }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.map.values()).finish()
    }
}
