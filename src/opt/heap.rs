//! Heap caching
//!
//! Remembers the last value read from or written to each field, array item
//! and interior field, so repeated loads collapse into one. Stores are held
//! back as a single lazy store per descr and only emitted when something
//! could observe the memory: an aliasing access, a call that may read it, a
//! guard, or the end of the trace. A store of the value already known to be
//! there is dropped.

use super::core::{Chain, OptContext, Pass};
use super::value::ValueId;
use crate::error::{OptError, Result};
use crate::ir::{Descr, EffectInfo, Op, Opcode, Operand};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeMap;
use std::hash::Hash;
use tracing::{debug, warn};

/// A cache key: the struct (and element index) a value lives in
trait HeapKey: Copy + Eq + Hash {
    fn may_alias(&self, other: &Self, ctx: &OptContext) -> bool;
    fn object(&self) -> ValueId;
}

impl HeapKey for ValueId {
    fn may_alias(&self, other: &Self, ctx: &OptContext) -> bool {
        self == other || !ctx.known_distinct(*self, *other)
    }

    fn object(&self) -> ValueId {
        *self
    }
}

impl HeapKey for (ValueId, i64) {
    fn may_alias(&self, other: &Self, ctx: &OptContext) -> bool {
        self.1 == other.1 && self.0.may_alias(&other.0, ctx)
    }

    fn object(&self) -> ValueId {
        self.0
    }
}

/// What is known about one descr
///
/// A pending store is always reflected in its cache, so a read of the
/// pending key never needs the store emitted first.
#[derive(Debug, Clone)]
enum Slot<K> {
    Clean,
    Cached(HashMap<K, ValueId>),
    Pending {
        store: Op,
        key: K,
        cache: HashMap<K, ValueId>,
    },
}

impl<K: HeapKey> Slot<K> {
    fn cache(&self) -> Option<&HashMap<K, ValueId>> {
        match self {
            Slot::Clean => None,
            Slot::Cached(cache) | Slot::Pending { cache, .. } => Some(cache),
        }
    }

    fn lookup(&self, key: &K) -> Option<ValueId> {
        self.cache().and_then(|c| c.get(key).copied())
    }

    fn pending_key(&self) -> Option<K> {
        match self {
            Slot::Pending { key, .. } => Some(*key),
            _ => None,
        }
    }

    /// Give up the lazy store, keeping what it taught us
    fn take_pending(&mut self) -> Option<Op> {
        match std::mem::replace(self, Slot::Clean) {
            Slot::Pending { store, cache, .. } => {
                *self = Slot::Cached(cache);
                Some(store)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    fn remember(&mut self, key: K, value: ValueId) {
        match self {
            Slot::Clean => {
                let mut cache = HashMap::default();
                cache.insert(key, value);
                *self = Slot::Cached(cache);
            }
            Slot::Cached(cache) | Slot::Pending { cache, .. } => {
                cache.insert(key, value);
            }
        }
    }

    /// Drop every entry that `key` may alias
    fn invalidate(&mut self, key: &K, ctx: &OptContext) {
        if let Slot::Cached(cache) | Slot::Pending { cache, .. } = self {
            cache.retain(|k, _| !k.may_alias(key, ctx));
        }
    }

    /// Drop every entry on an object that may be `object`
    fn invalidate_object(&mut self, object: ValueId, ctx: &OptContext) {
        if let Slot::Cached(cache) | Slot::Pending { cache, .. } = self {
            cache.retain(|k, _| !k.object().may_alias(&object, ctx));
        }
    }

    /// Requires that no store is pending
    fn make_pending(&mut self, store: Op, key: K, value: ValueId, ctx: &OptContext) {
        self.invalidate(&key, ctx);
        let mut cache = match std::mem::replace(self, Slot::Clean) {
            Slot::Cached(cache) | Slot::Pending { cache, .. } => cache,
            Slot::Clean => HashMap::default(),
        };
        cache.insert(key, value);
        *self = Slot::Pending { store, key, cache };
    }

    fn entries(&self) -> impl Iterator<Item = (&K, &ValueId)> {
        self.cache().into_iter().flat_map(|c| c.iter())
    }
}

/// All slots for one kind of memory
#[derive(Debug)]
struct HeapCache<K> {
    slots: BTreeMap<Descr, Slot<K>>,
}

impl<K> Default for HeapCache<K> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }
}

impl<K: HeapKey> HeapCache<K> {
    fn slot(&mut self, descr: &Descr) -> &mut Slot<K> {
        self.slots.entry(descr.clone()).or_insert(Slot::Clean)
    }

    fn lookup(&self, descr: &Descr, key: &K) -> Option<ValueId> {
        self.slots.get(descr).and_then(|s| s.lookup(key))
    }

    /// A pending store on a different key that `key` may alias
    fn pending_conflicts(&self, descr: &Descr, key: &K, ctx: &OptContext) -> bool {
        match self.slots.get(descr).and_then(|s| s.pending_key()) {
            Some(pending) => pending != *key && pending.may_alias(key, ctx),
            None => false,
        }
    }

    fn pending_elsewhere(&self, descr: &Descr, key: &K) -> bool {
        matches!(self.slots.get(descr).and_then(|s| s.pending_key()), Some(p) if p != *key)
    }

    fn take_pending(&mut self, descr: &Descr) -> Option<Op> {
        self.slots.get_mut(descr).and_then(|s| s.take_pending())
    }

    fn take_all_pending(&mut self) -> Vec<Op> {
        self.slots.values_mut().filter_map(|s| s.take_pending()).collect()
    }

    fn clear_all(&mut self) -> Vec<Op> {
        let pending = self.take_all_pending();
        self.slots.clear();
        pending
    }

    fn has_pending(&self) -> bool {
        self.slots.values().any(|s| s.pending_key().is_some())
    }
}

pub struct OptHeap {
    fields: HeapCache<ValueId>,
    array_items: HeapCache<(ValueId, i64)>,
    interior_fields: HeapCache<(ValueId, i64)>,
    /// (struct, descr) pairs read through `getfield_gc_pure`
    pure_reads: HashSet<(ValueId, Descr)>,
    /// Quasi-immutable fields this trace stores to
    mutated_quasi_immutables: HashSet<Descr>,
    seen_guard_not_invalidated: bool,
}

impl Default for OptHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// How a call can touch the heap
enum CallEffect<'e> {
    None,
    Some(&'e EffectInfo),
    Everything,
}

fn call_effect(op: &Op) -> CallEffect<'_> {
    if op.opcode == Opcode::CallPure {
        return CallEffect::None;
    }
    match op.descr.as_ref().and_then(|d| d.effect_info()) {
        None => CallEffect::Everything,
        Some(effect) if effect.has_random_effects() || effect.check_forces_virtual_or_virtualizable() => {
            CallEffect::Everything
        }
        Some(effect) => CallEffect::Some(effect),
    }
}

/// Readers see the lazy store, writers also invalidate the cache
fn apply_effect<K: HeapKey>(
    slot: &mut Slot<K>,
    reads: &HashSet<Descr>,
    writes: &HashSet<Descr>,
    descr: &Descr,
    stores: &mut Vec<Op>,
) {
    if writes.contains(descr) {
        stores.extend(slot.take_pending());
        *slot = Slot::Clean;
    } else if reads.contains(descr) {
        stores.extend(slot.take_pending());
    }
}

/// Operations that neither read nor write the cached memory
fn leaves_heap_alone(opcode: Opcode) -> bool {
    opcode.has_no_side_effect()
        || matches!(
            opcode,
            Opcode::SameAs
                | Opcode::DebugMergePoint
                | Opcode::RecordKnownClass
                | Opcode::VirtualRefFinish
                | Opcode::Strlen
                | Opcode::Strgetitem
                | Opcode::Strsetitem
                | Opcode::Copystrcontent
                | Opcode::SetfieldRaw
                | Opcode::GetfieldGcPure
                | Opcode::GetarrayitemGcPure
        )
}

impl OptHeap {
    pub fn new() -> Self {
        Self {
            fields: HeapCache::default(),
            array_items: HeapCache::default(),
            interior_fields: HeapCache::default(),
            pure_reads: HashSet::default(),
            mutated_quasi_immutables: HashSet::default(),
            seen_guard_not_invalidated: false,
        }
    }

    fn emit_stores(stores: Vec<Op>, chain: &mut Chain<'_>) -> Result<()> {
        for store in stores {
            debug!(store = %store, "lazy store emitted");
            chain.emit(store)?;
        }
        Ok(())
    }

    fn flush_all(&mut self, chain: &mut Chain<'_>) -> Result<()> {
        let mut stores = self.fields.take_all_pending();
        stores.extend(self.array_items.take_all_pending());
        stores.extend(self.interior_fields.take_all_pending());
        Self::emit_stores(stores, chain)
    }

    fn clear_all(&mut self, chain: &mut Chain<'_>) -> Result<()> {
        let mut stores = self.fields.clear_all();
        stores.extend(self.array_items.clear_all());
        stores.extend(self.interior_fields.clear_all());
        Self::emit_stores(stores, chain)
    }

    fn has_pending(&self) -> bool {
        self.fields.has_pending() || self.array_items.has_pending() || self.interior_fields.has_pending()
    }

    /// Before a guard, lazy stores of virtuals move into the guard's resume
    /// data instead of being emitted
    fn flush_for_guard(&mut self, chain: &mut Chain<'_>) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }
        let mut keep = Vec::new();
        let mut emit = Vec::new();
        for cache in [&mut self.array_items, &mut self.interior_fields] {
            for slot in cache.slots.values_mut() {
                if let Some(store) = slot.take_pending() {
                    emit.push(store);
                }
            }
        }
        for slot in self.fields.slots.values_mut() {
            let Slot::Pending { store, key, .. } = &*slot else {
                continue;
            };
            let value = chain.ctx.value_of(store.arg(1));
            if chain.ctx.is_virtual(value) && !chain.ctx.is_virtual(*key) {
                keep.push(store.clone());
                continue;
            }
            if let Some(store) = slot.take_pending() {
                emit.push(store);
            }
        }
        Self::emit_stores(emit, chain)?;
        chain.ctx.pending_fields.extend(keep);
        Ok(())
    }

    // ==================== Fields ====================

    fn optimize_getfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let (Some(descr), Some(result)) = (op.descr.clone(), op.result) else {
            return chain.emit(op);
        };
        let key = chain.value(op.arg(0));
        if op.opcode == Opcode::GetfieldGcPure {
            self.pure_reads.insert((key, descr.clone()));
        }
        if self.fields.pending_conflicts(&descr, &key, chain.ctx) {
            let stores = self.fields.take_pending(&descr).into_iter().collect();
            Self::emit_stores(stores, chain)?;
        }
        if let Some(known) = self.fields.lookup(&descr, &key) {
            debug!(op = %op, "field read served from cache");
            return chain.ctx.make_equal(result, known);
        }
        chain.emit(op)?;
        let value = chain.value(Operand::Box(result));
        self.fields.slot(&descr).remember(key, value);
        Ok(())
    }

    fn optimize_setfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(descr) = op.descr.clone() else {
            return chain.emit(op);
        };
        let key = chain.value(op.arg(0));
        let value = chain.value(op.arg(1));
        if let Some(info) = descr.as_field() {
            if info.immutable && self.pure_reads.contains(&(key, descr.clone())) {
                warn!(field = descr.name(), "store to an immutable field that was already read");
                return Err(OptError::bogus_pure_field(descr.name()));
            }
            if info.quasi_immutable {
                self.mutated_quasi_immutables.insert(descr.clone());
            }
        }
        if self.fields.lookup(&descr, &key) == Some(value) {
            debug!(op = %op, "redundant store dropped");
            return Ok(());
        }
        if self.fields.pending_elsewhere(&descr, &key) {
            let stores = self.fields.take_pending(&descr).into_iter().collect();
            Self::emit_stores(stores, chain)?;
        }
        // a pending store to the same key is simply overwritten
        let slot = self.fields.slot(&descr);
        let _ = slot.take_pending();
        slot.make_pending(op, key, value, chain.ctx);
        Ok(())
    }

    // ==================== Arrays ====================

    fn items(&mut self, interior: bool) -> &mut HeapCache<(ValueId, i64)> {
        if interior {
            &mut self.interior_fields
        } else {
            &mut self.array_items
        }
    }

    fn optimize_getarrayitem(&mut self, op: Op, chain: &mut Chain<'_>, interior: bool) -> Result<()> {
        let (Some(descr), Some(result)) = (op.descr.clone(), op.result) else {
            return chain.emit(op);
        };
        let object = chain.value(op.arg(0));
        let cache = self.items(interior);
        let Some(index) = chain.ctx.get_constant_int(op.arg(1)) else {
            let stores = cache.take_pending(&descr).into_iter().collect();
            Self::emit_stores(stores, chain)?;
            return chain.emit(op);
        };
        let key = (object, index);
        if cache.pending_conflicts(&descr, &key, chain.ctx) {
            let stores = cache.take_pending(&descr).into_iter().collect();
            Self::emit_stores(stores, chain)?;
        }
        let cache = self.items(interior);
        if let Some(known) = cache.lookup(&descr, &key) {
            debug!(op = %op, "array read served from cache");
            return chain.ctx.make_equal(result, known);
        }
        chain.emit(op)?;
        let value = chain.value(Operand::Box(result));
        let cache = self.items(interior);
        cache.slot(&descr).remember(key, value);
        Ok(())
    }

    fn optimize_setarrayitem(&mut self, op: Op, chain: &mut Chain<'_>, interior: bool) -> Result<()> {
        let Some(descr) = op.descr.clone() else {
            return chain.emit(op);
        };
        let object = chain.value(op.arg(0));
        let value = chain.value(op.arg(2));
        let Some(index) = chain.ctx.get_constant_int(op.arg(1)) else {
            let cache = if interior {
                &mut self.interior_fields
            } else {
                &mut self.array_items
            };
            let stores: Vec<Op> = cache.take_pending(&descr).into_iter().collect();
            // a fresh array aliases nothing cached, so this only drops its own items
            cache.slot(&descr).invalidate_object(object, chain.ctx);
            Self::emit_stores(stores, chain)?;
            return chain.emit(op);
        };
        let key = (object, index);
        let cache = self.items(interior);
        if cache.lookup(&descr, &key) == Some(value) {
            return Ok(());
        }
        if cache.pending_elsewhere(&descr, &key) {
            let stores = cache.take_pending(&descr).into_iter().collect();
            Self::emit_stores(stores, chain)?;
        }
        let cache = self.items(interior);
        let slot = cache.slot(&descr);
        let _ = slot.take_pending();
        slot.make_pending(op, key, value, chain.ctx);
        Ok(())
    }

    // ==================== Calls ====================

    fn optimize_call(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        match call_effect(&op) {
            CallEffect::None => {}
            CallEffect::Everything => {
                self.clear_all(chain)?;
                self.seen_guard_not_invalidated = false;
            }
            CallEffect::Some(effect) => {
                let mut stores = Vec::new();
                for (descr, slot) in self.fields.slots.iter_mut() {
                    apply_effect(slot, &effect.readonly_fields, &effect.write_fields, descr, &mut stores);
                }
                for (descr, slot) in self.array_items.slots.iter_mut() {
                    apply_effect(slot, &effect.readonly_arrays, &effect.write_arrays, descr, &mut stores);
                }
                for (descr, slot) in self.interior_fields.slots.iter_mut() {
                    if let Some(info) = descr.as_interior() {
                        let array = info.array.clone();
                        apply_effect(slot, &effect.readonly_arrays, &effect.write_arrays, &array, &mut stores);
                    }
                }
                if !effect.is_elidable() {
                    self.seen_guard_not_invalidated = false;
                }
                Self::emit_stores(stores, chain)?;
            }
        }
        chain.emit(op)
    }

    // ==================== Quasi-immutables ====================

    fn optimize_quasiimmut_field(&mut self, op: &Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(descr) = op.descr.clone() else {
            return Ok(());
        };
        if self.mutated_quasi_immutables.contains(&descr) {
            return Err(OptError::invalid_loop(format!(
                "quasi-immutable field {} is written by the loop",
                descr.name()
            )));
        }
        debug!(field = descr.name(), "quasi-immutable dependency");
        chain.ctx.record_quasi_immutable_dep(descr);
        Ok(())
    }
}

impl Pass for OptHeap {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        match op.opcode {
            Opcode::GetfieldGc | Opcode::GetfieldGcPure => self.optimize_getfield(op, chain),
            Opcode::SetfieldGc => self.optimize_setfield(op, chain),
            Opcode::GetarrayitemGc | Opcode::GetarrayitemGcPure => self.optimize_getarrayitem(op, chain, false),
            Opcode::SetarrayitemGc => self.optimize_setarrayitem(op, chain, false),
            Opcode::GetinteriorfieldGc => self.optimize_getarrayitem(op, chain, true),
            Opcode::SetinteriorfieldGc => self.optimize_setarrayitem(op, chain, true),
            Opcode::QuasiimmutField => self.optimize_quasiimmut_field(&op, chain),
            Opcode::GuardNotInvalidated => {
                if std::mem::replace(&mut self.seen_guard_not_invalidated, true) {
                    return Ok(());
                }
                self.flush_for_guard(chain)?;
                chain.emit(op)
            }
            opcode if opcode.is_call() => self.optimize_call(op, chain),
            opcode if opcode.is_guard() => {
                self.flush_for_guard(chain)?;
                chain.emit(op)
            }
            Opcode::Jump | Opcode::Finish | Opcode::Label => {
                self.flush_all(chain)?;
                chain.emit(op)
            }
            opcode if leaves_heap_alone(opcode) => chain.emit(op),
            _ => {
                self.clear_all(chain)?;
                chain.emit(op)
            }
        }
    }

    fn flush(&mut self, chain: &mut Chain<'_>) -> Result<()> {
        self.flush_all(chain)
    }

    fn produce_potential_short_preamble_ops(&self, ctx: &OptContext, out: &mut Vec<Op>) {
        for (descr, slot) in &self.fields.slots {
            for (object, value) in slot.entries() {
                let Some(result) = ctx.value(*value).operand.as_box() else {
                    continue;
                };
                let object = ctx.value(*object).operand;
                out.push(Op::new(Opcode::GetfieldGc, vec![object], Some(result)).with_descr(descr.clone()));
            }
        }
        for (descr, slot) in &self.array_items.slots {
            for ((object, index), value) in slot.entries() {
                let Some(result) = ctx.value(*value).operand.as_box() else {
                    continue;
                };
                let object = ctx.value(*object).operand;
                out.push(
                    Op::new(Opcode::GetarrayitemGc, vec![object, Operand::int(*index)], Some(result))
                        .with_descr(descr.clone()),
                );
            }
        }
    }
}
