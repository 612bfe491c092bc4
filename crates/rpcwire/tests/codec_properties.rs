// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Encapsulation codec properties through the public API: value round
// trips under both encodings, shared and cyclic class graphs, preservation
// of unknown slices, tagged member skipping and user exceptions.

#![allow(clippy::float_cmp)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

use std::any::Any;
use std::sync::Arc;

use rpcwire::protocol::{EncodingVersion, ENCODING_1_0, ENCODING_1_1};
use rpcwire::stream::{
    value_ptr, with_value, SlicedData, UnknownSlicedValue, ValuePtr, ValueSlot,
};
use rpcwire::{
    Context, Error, FormatType, Identity, InputStream, OutputStream, Result, TypeRegistry,
    UserException, Value,
};

const ENCODINGS: [EncodingVersion; 2] = [ENCODING_1_0, ENCODING_1_1];

// ============================================================================
// Test types
// ============================================================================

/// `class Item { string name; Item link; }`
#[derive(Default)]
struct Item {
    name: String,
    link: ValueSlot,
}

impl Value for Item {
    fn class_id(&self) -> &str {
        "::Shop::Item"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::Item", -1, true)?;
        os.write_string(&self.name);
        os.write_value(self.link.get().as_ref())?;
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        self.name = is.read_string()?;
        is.read_value_into(&self.link)?;
        is.end_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `exception NotFound { string key; }`
#[derive(Debug, Default)]
struct NotFound {
    key: String,
}

impl UserException for NotFound {
    fn class_id(&self) -> &str {
        "::Shop::NotFound"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::NotFound", -1, true)?;
        os.write_string(&self.key);
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        self.key = is.read_string()?;
        is.end_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `exception Discontinued extends NotFound { int since; }`
#[derive(Debug, Default)]
struct Discontinued {
    key: String,
    since: i32,
}

impl UserException for Discontinued {
    fn class_id(&self) -> &str {
        "::Shop::Discontinued"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::Discontinued", -1, false)?;
        os.write_i32(self.since);
        os.end_slice()?;
        os.start_slice("::Shop::NotFound", -1, true)?;
        os.write_string(&self.key);
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        self.since = is.read_i32()?;
        is.end_slice()?;
        is.start_slice()?;
        self.key = is.read_string()?;
        is.end_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `class Product { string name; }`, keeping slices of unknown subclasses.
#[derive(Default)]
struct Product {
    name: String,
    sliced: Option<SlicedData>,
}

impl Value for Product {
    fn class_id(&self) -> &str {
        "::Shop::Product"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::Product", -1, true)?;
        os.write_string(&self.name);
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        self.name = is.read_string()?;
        is.end_slice()
    }

    fn sliced_data(&self) -> Option<&SlicedData> {
        self.sliced.as_ref()
    }

    fn sliced_data_mut(&mut self) -> Option<&mut Option<SlicedData>> {
        Some(&mut self.sliced)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `class Bundle extends Product { Item bonus; optional(3) int discount; }`
#[derive(Default)]
struct Bundle {
    name: String,
    bonus: ValueSlot,
    discount: Option<i32>,
}

impl Value for Bundle {
    fn class_id(&self) -> &str {
        "::Shop::Bundle"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::Bundle", -1, false)?;
        os.write_value(self.bonus.get().as_ref())?;
        os.write_optional_i32(3, self.discount);
        os.end_slice()?;
        os.start_slice("::Shop::Product", -1, true)?;
        os.write_string(&self.name);
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        is.read_value_into(&self.bonus)?;
        self.discount = is.read_optional_i32(3)?;
        is.end_slice()?;
        is.start_slice()?;
        self.name = is.read_string()?;
        is.end_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// `class Tag { string label; }` with compact id 41.
#[derive(Default)]
struct Tag {
    label: String,
}

const TAG_COMPACT_ID: i32 = 41;

impl Value for Tag {
    fn class_id(&self) -> &str {
        "::Shop::Tag"
    }

    fn write_impl(&self, os: &mut OutputStream) -> Result<()> {
        os.start_slice("::Shop::Tag", TAG_COMPACT_ID, true)?;
        os.write_string(&self.label);
        os.end_slice()
    }

    fn read_impl(&mut self, is: &mut InputStream) -> Result<()> {
        is.start_slice()?;
        self.label = is.read_string()?;
        is.end_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn item(name: &str, link: Option<ValuePtr>) -> ValuePtr {
    value_ptr(Item {
        name: name.to_string(),
        link: ValueSlot::new(link),
    })
}

fn item_registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry
        .add_value_factory("::Shop::Item", |_| Some(value_ptr(Item::default())))
        .unwrap();
    Arc::new(registry)
}

fn encode_values(encoding: EncodingVersion, format: FormatType, roots: &[&ValuePtr]) -> Vec<u8> {
    let mut os = OutputStream::new(encoding);
    os.start_encapsulation_with(encoding, format);
    for root in roots {
        os.write_value(Some(root)).unwrap();
    }
    os.write_pending_values().unwrap();
    os.end_encapsulation().unwrap();
    os.into_bytes()
}

fn decode_values(bytes: Vec<u8>, registry: Arc<TypeRegistry>, count: usize) -> Vec<ValueSlot> {
    let mut is = InputStream::new(ENCODING_1_1, bytes).with_registry(registry);
    is.start_encapsulation().unwrap();
    let slots: Vec<ValueSlot> = (0..count).map(|_| ValueSlot::default()).collect();
    for slot in &slots {
        is.read_value_into(slot).unwrap();
    }
    is.read_pending_values().unwrap();
    is.end_encapsulation().unwrap();
    slots
}

fn name_of(slot: &ValueSlot) -> String {
    with_value(&slot.get().unwrap(), |i: &Item| i.name.clone()).unwrap()
}

fn link_of(slot: &ValueSlot) -> ValueSlot {
    with_value(&slot.get().unwrap(), |i: &Item| i.link.clone()).unwrap()
}

fn tag(label: &str) -> ValuePtr {
    value_ptr(Tag {
        label: label.to_string(),
    })
}

fn label_of(slot: &ValueSlot) -> String {
    with_value(&slot.get().unwrap(), |t: &Tag| t.label.clone()).unwrap()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn exception_encaps(encoding: EncodingVersion, ex: &dyn UserException) -> Vec<u8> {
    let mut os = OutputStream::new(encoding);
    os.start_encapsulation_with(encoding, FormatType::Sliced);
    os.write_exception(ex).unwrap();
    os.end_encapsulation().unwrap();
    os.into_bytes()
}

fn read_exception(bytes: Vec<u8>, registry: Arc<TypeRegistry>) -> Result<Box<dyn UserException>> {
    let mut is = InputStream::new(ENCODING_1_1, bytes).with_registry(registry);
    is.start_encapsulation()?;
    let ex = is.read_exception()?;
    is.end_encapsulation()?;
    Ok(ex)
}

// ============================================================================
// Primitives and framing
// ============================================================================

#[test]
fn test_request_body_fields_roundtrip() {
    let mut ctx = Context::new();
    ctx.insert("locale".into(), "fr_FR".into());
    ctx.insert("tenant".into(), "acme".into());
    let identity = Identity::with_category("cart", "session");

    for encoding in ENCODINGS {
        let mut os = OutputStream::new(encoding);
        os.write_identity(&identity);
        os.write_context(&ctx);
        os.write_string_seq(&["a", "", "ccc"]);
        os.write_f64_seq(&[0.5, -1.25]);
        os.write_i64(i64::MIN);
        os.write_bool(true);
        os.write_size(300);

        let mut is = InputStream::new(encoding, os.into_bytes());
        assert_eq!(is.read_identity().unwrap(), identity);
        assert_eq!(is.read_context().unwrap(), ctx);
        assert_eq!(is.read_string_seq().unwrap(), vec!["a", "", "ccc"]);
        assert_eq!(is.read_f64_seq().unwrap(), vec![0.5, -1.25]);
        assert_eq!(is.read_i64().unwrap(), i64::MIN);
        assert!(is.read_bool().unwrap());
        assert_eq!(is.read_size().unwrap(), 300);
        assert_eq!(is.remaining(), 0);
    }
}

#[test]
fn test_nested_encapsulation_boundary() {
    let mut inner = OutputStream::new(ENCODING_1_1);
    inner.start_encapsulation();
    inner.write_string("inner");
    inner.end_encapsulation().unwrap();
    let inner = inner.into_bytes();

    let mut os = OutputStream::new(ENCODING_1_1);
    os.start_encapsulation();
    os.write_i32(1);
    os.write_encapsulation(&inner).unwrap();
    os.write_i32(2);
    os.end_encapsulation().unwrap();

    let mut is = InputStream::new(ENCODING_1_1, os.into_bytes());
    is.start_encapsulation().unwrap();
    assert_eq!(is.read_i32().unwrap(), 1);
    assert_eq!(is.start_encapsulation().unwrap(), ENCODING_1_1);
    assert_eq!(is.read_string().unwrap(), "inner");
    is.end_encapsulation().unwrap();
    assert_eq!(is.read_i32().unwrap(), 2);
    is.end_encapsulation().unwrap();
    assert_eq!(is.remaining(), 0);
}

#[test]
fn test_unread_bytes_in_encapsulation_detected() {
    let mut os = OutputStream::new(ENCODING_1_1);
    os.start_encapsulation();
    os.write_i32(1);
    os.write_i32(2);
    os.end_encapsulation().unwrap();

    let mut is = InputStream::new(ENCODING_1_1, os.into_bytes());
    is.start_encapsulation().unwrap();
    is.read_i32().unwrap();
    assert!(is.end_encapsulation().is_err());
}

#[test]
fn test_newer_reader_skips_unknown_tags() {
    // Writer knows tags 1, 3 and 7; the reader only tag 7.
    let mut os = OutputStream::new(ENCODING_1_1);
    os.start_encapsulation();
    os.write_string("required");
    os.write_optional_i32(1, Some(11));
    os.write_optional_string(3, Some("three"));
    os.write_optional_i32_seq(7, Some(&[7, 7]));
    os.end_encapsulation().unwrap();

    let mut is = InputStream::new(ENCODING_1_1, os.into_bytes());
    is.start_encapsulation().unwrap();
    assert_eq!(is.read_string().unwrap(), "required");
    assert_eq!(is.read_optional_i32(2).unwrap(), None);
    assert_eq!(is.read_optional_i32_seq(7).unwrap(), Some(vec![7, 7]));
    assert_eq!(is.read_optional_string(8).unwrap(), None);
    is.end_encapsulation().unwrap();
}

// ============================================================================
// Class graphs
// ============================================================================

#[test]
fn test_shared_instance_decoded_once() {
    for (encoding, format) in [
        (ENCODING_1_0, FormatType::Default),
        (ENCODING_1_1, FormatType::Compact),
        (ENCODING_1_1, FormatType::Sliced),
    ] {
        let shared = item("shared", None);
        let a = item("a", Some(shared.clone()));
        let b = item("b", Some(shared.clone()));
        let bytes = encode_values(encoding, format, &[&a, &b]);

        let slots = decode_values(bytes, item_registry(), 2);
        assert_eq!(name_of(&slots[0]), "a");
        assert_eq!(name_of(&slots[1]), "b");
        let from_a = link_of(&slots[0]).get().unwrap();
        let from_b = link_of(&slots[1]).get().unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b), "{:?}", format);
    }
}

#[test]
fn test_self_reference_survives_roundtrip() {
    for encoding in ENCODINGS {
        let looped = item("loop", None);
        with_value(&looped, |i: &Item| i.link.set(Some(looped.clone())));

        let bytes = encode_values(encoding, FormatType::Sliced, &[&looped]);
        let slots = decode_values(bytes, item_registry(), 1);
        let decoded = slots[0].get().unwrap();
        assert!(link_of(&slots[0]).points_to(&decoded));

        with_value(&looped, |i: &Item| i.link.set(None));
        with_value(&decoded, |i: &Item| i.link.set(None));
    }
}

#[test]
fn test_unknown_value_forwarded_unchanged() {
    let original = item("opaque", None);
    let bytes = encode_values(ENCODING_1_1, FormatType::Sliced, &[&original]);

    // An intermediary without the type keeps its slices...
    let slots = decode_values(bytes.clone(), Arc::new(TypeRegistry::new()), 1);
    let opaque = slots[0].get().unwrap();
    assert_eq!(opaque.lock().class_id(), "::Shop::Item");

    // ...and writes them back byte for byte.
    let forwarded = encode_values(ENCODING_1_1, FormatType::Sliced, &[&opaque]);
    assert_eq!(forwarded, bytes);

    // The final receiver knows the type again.
    let slots = decode_values(forwarded, item_registry(), 1);
    assert_eq!(name_of(&slots[0]), "opaque");
}

#[test]
fn test_unknown_compact_value_rejected() {
    let original = item("compact", None);
    let bytes = encode_values(ENCODING_1_1, FormatType::Compact, &[&original]);

    let mut is = InputStream::new(ENCODING_1_1, bytes).with_registry(Arc::new(TypeRegistry::new()));
    is.start_encapsulation().unwrap();
    let slot = ValueSlot::default();
    let err = is.read_value_into(&slot).unwrap_err();
    assert!(matches!(err, Error::NoValueFactory { .. }), "{}", err);
}

#[test]
fn test_unknown_subclass_slice_preserved_by_base() {
    let bonus = item("bonus", None);
    let original = value_ptr(Bundle {
        name: "starter kit".into(),
        bonus: ValueSlot::new(Some(bonus)),
        discount: Some(15),
    });
    let bytes = encode_values(ENCODING_1_1, FormatType::Sliced, &[&original]);

    // The intermediary knows Product and Item, not Bundle.
    let registry = TypeRegistry::new();
    registry
        .add_value_factory("::Shop::Product", |_| Some(value_ptr(Product::default())))
        .unwrap();
    registry
        .add_value_factory("::Shop::Item", |_| Some(value_ptr(Item::default())))
        .unwrap();
    let slots = decode_values(bytes.clone(), Arc::new(registry), 1);
    let product = slots[0].get().unwrap();
    let (name, sliced) =
        with_value(&product, |p: &Product| (p.name.clone(), p.sliced.clone())).unwrap();
    assert_eq!(name, "starter kit");

    let sliced = sliced.unwrap();
    assert_eq!(sliced.slices.len(), 1);
    let slice = &sliced.slices[0];
    assert_eq!(slice.type_id, "::Shop::Bundle");
    assert!(slice.has_optional_members);
    assert!(!slice.is_last_slice);
    assert_eq!(slice.instances.len(), 1);
    assert_eq!(name_of(&slice.instances[0]), "bonus");

    let forwarded = encode_values(ENCODING_1_1, FormatType::Sliced, &[&product]);
    assert_eq!(forwarded, bytes);

    // The final receiver reads the full Bundle back.
    let registry = TypeRegistry::new();
    registry
        .add_value_factory("::Shop::Bundle", |_| Some(value_ptr(Bundle::default())))
        .unwrap();
    registry
        .add_value_factory("::Shop::Item", |_| Some(value_ptr(Item::default())))
        .unwrap();
    let slots = decode_values(forwarded, Arc::new(registry), 1);
    let (name, discount, bonus) = with_value(&slots[0].get().unwrap(), |b: &Bundle| {
        (b.name.clone(), b.discount, b.bonus.clone())
    })
    .unwrap();
    assert_eq!(name, "starter kit");
    assert_eq!(discount, Some(15));
    assert_eq!(name_of(&bonus), "bonus");
}

#[test]
fn test_compact_type_id_roundtrip() {
    let registry = TypeRegistry::new();
    registry
        .add_value_factory("::Shop::Tag", |_| Some(value_ptr(Tag::default())))
        .unwrap();
    registry.register_compact_id(TAG_COMPACT_ID, "::Shop::Tag").unwrap();
    let registry = Arc::new(registry);

    for format in [FormatType::Compact, FormatType::Sliced] {
        let bytes = encode_values(ENCODING_1_1, format, &[&tag("new"), &tag("sale")]);
        assert!(!contains(&bytes, b"::Shop::Tag"), "{:?}", format);

        let slots = decode_values(bytes, registry.clone(), 2);
        assert_eq!(label_of(&slots[0]), "new");
        assert_eq!(label_of(&slots[1]), "sale");
    }
}

#[test]
fn test_unresolved_compact_id_sliced_and_forwarded() {
    let original = tag("clearance");
    let bytes = encode_values(ENCODING_1_1, FormatType::Sliced, &[&original]);

    // Factory present, compact id mapping missing.
    let registry = TypeRegistry::new();
    registry
        .add_value_factory("::Shop::Tag", |_| Some(value_ptr(Tag::default())))
        .unwrap();
    let slots = decode_values(bytes.clone(), Arc::new(registry), 1);
    let opaque = slots[0].get().unwrap();
    let compact_ids = with_value(&opaque, |u: &UnknownSlicedValue| {
        let sliced = u.sliced_data().unwrap();
        sliced
            .slices
            .iter()
            .map(|s| (s.type_id.clone(), s.compact_id))
            .collect::<Vec<_>>()
    })
    .unwrap();
    assert_eq!(compact_ids, vec![(String::new(), TAG_COMPACT_ID)]);

    let forwarded = encode_values(ENCODING_1_1, FormatType::Sliced, &[&opaque]);
    assert_eq!(forwarded, bytes);
}

#[test]
fn test_unresolved_compact_id_in_compact_format_rejected() {
    let bytes = encode_values(ENCODING_1_1, FormatType::Compact, &[&tag("clearance")]);

    let mut is = InputStream::new(ENCODING_1_1, bytes).with_registry(Arc::new(TypeRegistry::new()));
    is.start_encapsulation().unwrap();
    let slot = ValueSlot::default();
    let err = is.read_value_into(&slot).unwrap_err();
    assert!(matches!(err, Error::NoValueFactory { .. }), "{}", err);
}

// ============================================================================
// User exceptions
// ============================================================================

#[test]
fn test_exception_roundtrip() {
    let registry = TypeRegistry::new();
    registry
        .add_exception_factory("::Shop::NotFound", |_| Some(Box::new(NotFound::default())))
        .unwrap();
    let registry = Arc::new(registry);

    for encoding in ENCODINGS {
        let sent = NotFound {
            key: "sku-42".into(),
        };
        let ex = read_exception(exception_encaps(encoding, &sent), registry.clone()).unwrap();
        assert_eq!(ex.class_id(), "::Shop::NotFound");
        assert_eq!(ex.downcast_ref::<NotFound>().unwrap().key, "sku-42");
    }
}

#[test]
fn test_derived_exception_sliced_to_known_base() {
    let registry = TypeRegistry::new();
    registry
        .add_exception_factory("::Shop::NotFound", |_| Some(Box::new(NotFound::default())))
        .unwrap();
    let registry = Arc::new(registry);

    for encoding in ENCODINGS {
        let sent = Discontinued {
            key: "sku-7".into(),
            since: 2019,
        };
        let ex = read_exception(exception_encaps(encoding, &sent), registry.clone()).unwrap();
        let base = ex.downcast_ref::<NotFound>().unwrap();
        assert_eq!(base.key, "sku-7");
    }
}

#[test]
fn test_unknown_exception_reports_most_derived_type() {
    for encoding in ENCODINGS {
        let sent = Discontinued {
            key: "sku-7".into(),
            since: 2019,
        };
        let err = read_exception(
            exception_encaps(encoding, &sent),
            Arc::new(TypeRegistry::new()),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownUserException {
                type_id: "Shop::Discontinued".into()
            }
        );
    }
}
