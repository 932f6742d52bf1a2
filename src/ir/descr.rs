//! Descrs: identity-compared tokens naming fields, arrays and call signatures
//!
//! Two operations can share a cache entry only when their descrs are the
//! same token. Structural equality never counts: two distinct field descrs
//! with the same name are different fields.

use super::operation::BoxKind;
use rustc_hash::FxHashSet as HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static NEXT_DESCR_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque, identity-compared descr token
#[derive(Clone)]
pub struct Descr(Arc<DescrData>);

/// Payload of a descr
#[derive(Debug)]
pub struct DescrData {
    /// Creation order, used as the sort key when emitting fields
    pub id: u64,
    pub name: String,
    pub kind: DescrKind,
}

/// What a descr describes
#[derive(Debug)]
pub enum DescrKind {
    Field(FieldInfo),
    Array(ArrayInfo),
    /// A field inside the elements of an array of structs
    InteriorField(InteriorFieldInfo),
    /// Size of a struct; instances with a vtable carry their class
    Size(SizeInfo),
    Call(CallInfo),
    /// Jump target (loop header)
    Target,
    /// Resume point of a guard
    Resume,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Name of the struct owning the field
    pub owner: String,
    pub value: BoxKind,
    /// Declared immutable by the front end
    pub immutable: bool,
    /// Immutable unless invalidated by a quasi-immutable dependency
    pub quasi_immutable: bool,
}

#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub item: BoxKind,
    pub immutable: bool,
}

#[derive(Debug, Clone)]
pub struct InteriorFieldInfo {
    pub array: Descr,
    pub field: Descr,
}

#[derive(Debug, Clone)]
pub struct SizeInfo {
    /// Vtable address for `new_with_vtable`
    pub class: Option<i64>,
    pub immutable: bool,
}

#[derive(Debug, Clone)]
pub struct CallInfo {
    pub result: Option<BoxKind>,
    pub effect: EffectInfo,
}

/// What a call may do, as summarized by the front end
#[derive(Debug, Clone, Default)]
pub struct EffectInfo {
    pub readonly_fields: HashSet<Descr>,
    pub write_fields: HashSet<Descr>,
    pub readonly_arrays: HashSet<Descr>,
    pub write_arrays: HashSet<Descr>,
    pub extra: ExtraEffect,
    pub oopspec: OopSpec,
}

/// Coarse effect class of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExtraEffect {
    /// Pure and total
    ElidableCannotRaise,
    /// Same result for the whole loop
    LoopInvariant,
    CannotRaise,
    /// Pure, but may raise
    ElidableCanRaise,
    CanRaise,
    /// May force virtualizables or virtual refs
    ForcesVirtual,
    /// Nothing is known; assume the worst
    #[default]
    RandomEffects,
}

/// Recognized helper semantics of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OopSpec {
    #[default]
    None,
    StrConcat,
    StrSlice,
    StrEqual,
    StreqSliceChar,
    StreqNonnullChar,
    StreqChecknullChar,
    StreqSliceNonnull,
    StreqSliceChecknull,
    StreqLengthok,
    StreqNonnull,
}

impl OopSpec {
    /// Helper functions the string pass lowers equality tests to
    pub const STREQ_HELPERS: &'static [OopSpec] = &[
        OopSpec::StreqSliceChar,
        OopSpec::StreqNonnullChar,
        OopSpec::StreqChecknullChar,
        OopSpec::StreqSliceNonnull,
        OopSpec::StreqSliceChecknull,
        OopSpec::StreqLengthok,
        OopSpec::StreqNonnull,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OopSpec::None => "none",
            OopSpec::StrConcat => "str_concat",
            OopSpec::StrSlice => "str_slice",
            OopSpec::StrEqual => "str_equal",
            OopSpec::StreqSliceChar => "streq_slice_char",
            OopSpec::StreqNonnullChar => "streq_nonnull_char",
            OopSpec::StreqChecknullChar => "streq_checknull_char",
            OopSpec::StreqSliceNonnull => "streq_slice_nonnull",
            OopSpec::StreqSliceChecknull => "streq_slice_checknull",
            OopSpec::StreqLengthok => "streq_lengthok",
            OopSpec::StreqNonnull => "streq_nonnull",
        }
    }

    pub fn from_name(name: &str) -> Option<OopSpec> {
        let all = [
            OopSpec::None,
            OopSpec::StrConcat,
            OopSpec::StrSlice,
            OopSpec::StrEqual,
        ];
        all.iter()
            .chain(OopSpec::STREQ_HELPERS)
            .copied()
            .find(|spec| spec.name() == name)
    }

    /// Fake function address of a helper, passed as the first call argument
    pub fn func_addr(&self) -> i64 {
        let index = match self {
            OopSpec::None => 0,
            OopSpec::StrConcat => 1,
            OopSpec::StrSlice => 2,
            OopSpec::StrEqual => 3,
            OopSpec::StreqSliceChar => 4,
            OopSpec::StreqNonnullChar => 5,
            OopSpec::StreqChecknullChar => 6,
            OopSpec::StreqSliceNonnull => 7,
            OopSpec::StreqSliceChecknull => 8,
            OopSpec::StreqLengthok => 9,
            OopSpec::StreqNonnull => 10,
        };
        0x7000_0000 + index
    }
}

impl EffectInfo {
    /// Summary of a pure, non-raising helper
    pub fn elidable(oopspec: OopSpec) -> Self {
        Self {
            extra: ExtraEffect::ElidableCannotRaise,
            oopspec,
            ..Self::default()
        }
    }

    /// Calls that can be folded or CSE'd
    pub fn is_elidable(&self) -> bool {
        matches!(
            self.extra,
            ExtraEffect::ElidableCannotRaise | ExtraEffect::ElidableCanRaise
        )
    }

    pub fn check_forces_virtual_or_virtualizable(&self) -> bool {
        self.extra >= ExtraEffect::ForcesVirtual
    }

    pub fn has_random_effects(&self) -> bool {
        self.extra == ExtraEffect::RandomEffects
    }
}

impl PartialOrd for ExtraEffect {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExtraEffect {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl Descr {
    fn make(name: impl Into<String>, kind: DescrKind) -> Self {
        Descr(Arc::new(DescrData {
            id: NEXT_DESCR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind,
        }))
    }

    /// A mutable field
    pub fn field(name: impl Into<String>, owner: impl Into<String>, value: BoxKind) -> Self {
        Self::make(
            name,
            DescrKind::Field(FieldInfo {
                owner: owner.into(),
                value,
                immutable: false,
                quasi_immutable: false,
            }),
        )
    }

    /// A field with explicit mutability flags
    pub fn field_with(name: impl Into<String>, info: FieldInfo) -> Self {
        Self::make(name, DescrKind::Field(info))
    }

    /// An immutable field
    pub fn pure_field(name: impl Into<String>, owner: impl Into<String>, value: BoxKind) -> Self {
        Self::make(
            name,
            DescrKind::Field(FieldInfo {
                owner: owner.into(),
                value,
                immutable: true,
                quasi_immutable: false,
            }),
        )
    }

    /// An array type
    pub fn array(name: impl Into<String>, item: BoxKind, immutable: bool) -> Self {
        Self::make(name, DescrKind::Array(ArrayInfo { item, immutable }))
    }

    /// A field of an array-of-structs element
    pub fn interior_field(name: impl Into<String>, array: Descr, field: Descr) -> Self {
        Self::make(
            name,
            DescrKind::InteriorField(InteriorFieldInfo { array, field }),
        )
    }

    /// A struct size, optionally with a vtable
    pub fn size(name: impl Into<String>, class: Option<i64>) -> Self {
        Self::make(
            name,
            DescrKind::Size(SizeInfo {
                class,
                immutable: false,
            }),
        )
    }

    /// A struct size with explicit immutability
    pub fn size_with(name: impl Into<String>, info: SizeInfo) -> Self {
        Self::make(name, DescrKind::Size(info))
    }

    /// A call signature with its effect summary
    pub fn call(name: impl Into<String>, result: Option<BoxKind>, effect: EffectInfo) -> Self {
        Self::make(name, DescrKind::Call(CallInfo { result, effect }))
    }

    /// A jump target
    pub fn target(name: impl Into<String>) -> Self {
        Self::make(name, DescrKind::Target)
    }

    /// A guard resume point
    pub fn resume(name: impl Into<String>) -> Self {
        Self::make(name, DescrKind::Resume)
    }

    /// Shared descr of a string helper
    pub fn helper(oopspec: OopSpec) -> Descr {
        static HELPERS: OnceLock<Vec<(OopSpec, Descr)>> = OnceLock::new();
        let helpers = HELPERS.get_or_init(|| {
            OopSpec::STREQ_HELPERS
                .iter()
                .map(|spec| {
                    let descr = Descr::call(
                        spec.name(),
                        Some(BoxKind::Int),
                        EffectInfo::elidable(*spec),
                    );
                    (*spec, descr)
                })
                .collect()
        });
        match helpers.iter().find(|(spec, _)| *spec == oopspec) {
            Some((_, descr)) => descr.clone(),
            None => Descr::call(oopspec.name(), None, EffectInfo::elidable(oopspec)),
        }
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &DescrKind {
        &self.0.kind
    }

    pub fn as_field(&self) -> Option<&FieldInfo> {
        match &self.0.kind {
            DescrKind::Field(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayInfo> {
        match &self.0.kind {
            DescrKind::Array(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_interior(&self) -> Option<&InteriorFieldInfo> {
        match &self.0.kind {
            DescrKind::InteriorField(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_size(&self) -> Option<&SizeInfo> {
        match &self.0.kind {
            DescrKind::Size(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&CallInfo> {
        match &self.0.kind {
            DescrKind::Call(info) => Some(info),
            _ => None,
        }
    }

    /// Effect summary of a call descr
    pub fn effect_info(&self) -> Option<&EffectInfo> {
        self.as_call().map(|c| &c.effect)
    }

    /// Reads through this descr always see the same value
    pub fn is_always_pure(&self) -> bool {
        match &self.0.kind {
            DescrKind::Field(info) => info.immutable,
            DescrKind::Array(info) => info.immutable,
            DescrKind::InteriorField(info) => info.field.is_always_pure(),
            _ => false,
        }
    }

    /// Kind of value stored behind a field, array or interior descr
    pub fn value_kind(&self) -> Option<BoxKind> {
        match &self.0.kind {
            DescrKind::Field(info) => Some(info.value),
            DescrKind::Array(info) => Some(info.item),
            DescrKind::InteriorField(info) => info.field.value_kind(),
            DescrKind::Call(info) => info.result,
            _ => None,
        }
    }

    /// Vtable of a size descr
    pub fn known_class(&self) -> Option<i64> {
        self.as_size().and_then(|s| s.class)
    }

    pub fn is_target(&self) -> bool {
        matches!(self.0.kind, DescrKind::Target)
    }
}

impl PartialEq for Descr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Descr {}

impl Hash for Descr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl PartialOrd for Descr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Descr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl std::fmt::Debug for Descr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Descr {}>", self.0.name)
    }
}

impl std::fmt::Display for Descr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_not_structure() {
        let a = Descr::field("valuedescr", "Node", BoxKind::Int);
        let b = Descr::field("valuedescr", "Node", BoxKind::Int);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        let set: HashSet<Descr> = [a.clone(), b.clone(), a.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_sort_key_is_creation_order() {
        let a = Descr::field("z", "S", BoxKind::Int);
        let b = Descr::field("a", "S", BoxKind::Int);
        assert!(a < b);
    }

    #[test]
    fn test_helper_descrs_are_shared() {
        let a = Descr::helper(OopSpec::StreqLengthok);
        let b = Descr::helper(OopSpec::StreqLengthok);
        assert_eq!(a, b);
        assert_eq!(a.effect_info().map(|e| e.oopspec), Some(OopSpec::StreqLengthok));
        assert!(a.effect_info().map(|e| e.is_elidable()).unwrap_or(false));
    }

    #[test]
    fn test_effect_ordering() {
        assert!(ExtraEffect::RandomEffects > ExtraEffect::ForcesVirtual);
        assert!(ExtraEffect::CanRaise < ExtraEffect::ForcesVirtual);
        let info = EffectInfo::default();
        assert!(info.has_random_effects());
        assert!(info.check_forces_virtual_or_virtualizable());
    }

    #[test]
    fn test_purity() {
        let f = Descr::pure_field("lengthdescr", "Str", BoxKind::Int);
        assert!(f.is_always_pure());
        let arr = Descr::array("arraydescr", BoxKind::Int, false);
        assert!(!arr.is_always_pure());
        assert_eq!(arr.value_kind(), Some(BoxKind::Int));
    }
}
