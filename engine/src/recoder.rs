//! The argument recoder (spec section 4.5): rewrites a client parameter
//! stream into the backend's expected layout, fanning out encoded tuples/
//! arrays (4.5.1), injecting session globals (4.5.2), and recoding
//! composite-typed globals (4.5.3).

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use db_wire::codec::{Reader, WriterExt};
use db_wire::common::NULL_TYPE_ID;

use crate::compile::{GlobalParam, InputParam, QueryUnit, TransformShape};
use crate::session::SessionView;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum RecodeError {
    #[display("parameter ${_0} is required")]
    #[error(ignore)]
    RequiredParameterMissing(String),
    #[display("array parameter has unsupported number of dimensions")]
    UnsupportedArrayDimensions,
    #[display("array parameter bound must be 1")]
    UnsupportedArrayBound,
    #[display("NULL array element is not allowed")]
    NullArrayElement,
    #[display("malformed parameter stream")]
    Malformed,
    #[display("trailing bytes after parameter stream")]
    TrailingBytes,
    #[display("argument count exceeds the protocol limit of 32767")]
    TooManyArguments,
    #[display("tuple element count does not match its declared shape")]
    TupleShapeMismatch,
    #[display("unknown backend type for array element")]
    UnresolvedArrayType,
}

impl From<db_wire::error::DecodeError> for RecodeError {
    fn from(_: db_wire::error::DecodeError) -> Self {
        RecodeError::Malformed
    }
}

const RESULT_FORMAT_ALL_BINARY: u32 = 0x0001_0001;
const ARRAY_BOUND: i32 = 1;

/// Format-code selection (spec section 4.5): binary-for-everything when
/// there are no extracted-literal extras, an empty/default vector when
/// extras are the *only* thing being sent, otherwise an explicit per-slot
/// vector.
fn format_codes(real_count: usize, extras_count: usize, global_slots: usize) -> Vec<u16> {
    if extras_count == 0 {
        vec![1]
    } else if real_count == 0 && global_slots == 0 {
        vec![]
    } else {
        let mut codes = Vec::with_capacity(real_count + extras_count + global_slots);
        codes.extend(std::iter::repeat(1).take(real_count));
        codes.extend(std::iter::repeat(0).take(extras_count));
        codes.extend(std::iter::repeat(1).take(global_slots));
        codes
    }
}

fn write_format_codes(out: &mut BytesMut, codes: &[u16]) {
    out.put_u16(codes.len() as u16);
    for c in codes {
        out.put_u16(*c);
    }
}

/// Rewrites the array header in-place: accepts `ndims` of 0 or 1, replaces
/// the element OID with the backend-resolved one, requires `bound == 1`,
/// and rejects NULL elements (spec section 4.5, array-parameter bullet).
fn rewrite_array(r: &mut Reader, out: &mut BytesMut, backend_oid: i32) -> Result<(), RecodeError> {
    let ndims = r.i32()?;
    if ndims != 0 && ndims != 1 {
        return Err(RecodeError::UnsupportedArrayDimensions);
    }
    let flags = r.i32()?;
    let _client_oid = r.i32()?;
    let count = r.i32()?;
    let bound = r.i32()?;
    if ndims == 1 && bound != ARRAY_BOUND {
        return Err(RecodeError::UnsupportedArrayBound);
    }
    out.put_i32(ndims);
    out.put_i32(flags);
    out.put_i32(backend_oid);
    out.put_i32(count);
    out.put_i32(bound);
    for _ in 0..count {
        match r.value()? {
            None => return Err(RecodeError::NullArrayElement),
            Some(bytes) => out.put_value(Some(&bytes)),
        }
    }
    Ok(())
}

/// Per-sub-parameter scratch state accumulated while fanning a tuple/array
/// parameter out into its backend-facing positional targets (spec section
/// 4.5.1).
#[derive(Default)]
struct FanOutScratch {
    buffers: HashMap<usize, BytesMut>,
    counts: HashMap<usize, i32>,
}

impl FanOutScratch {
    fn buf(&mut self, index: usize) -> &mut BytesMut {
        self.buffers.entry(index).or_default()
    }

    fn bump(&mut self, index: usize) {
        *self.counts.entry(index).or_insert(0) += 1;
    }
}

fn decode_shape(
    r: &mut Reader,
    shape: &TransformShape,
    scratch: &mut FanOutScratch,
    inside_array: bool,
) -> Result<(), RecodeError> {
    match shape {
        TransformShape::Scalar { target_index } => {
            let value = r.value()?;
            scratch.buf(*target_index).put_value(value.as_deref());
            if inside_array {
                scratch.bump(*target_index);
            }
            Ok(())
        }
        TransformShape::Tuple { elements } => {
            let n = r.i32()?;
            if n as usize != elements.len() {
                return Err(RecodeError::TupleShapeMismatch);
            }
            for element in elements {
                decode_shape(r, element, scratch, inside_array)?;
            }
            Ok(())
        }
        TransformShape::Array { element } => {
            let ndims = r.i32()?;
            if ndims != 0 && ndims != 1 {
                return Err(RecodeError::UnsupportedArrayDimensions);
            }
            let count = r.i32()?;
            let bound = r.i32()?;
            if ndims == 1 && bound != ARRAY_BOUND {
                return Err(RecodeError::UnsupportedArrayBound);
            }
            let mut offsets = vec![0i32];
            let mut running = 0i32;
            for _ in 0..count {
                let before: HashMap<usize, i32> = scratch.counts.clone();
                decode_shape(r, element, scratch, true)?;
                // Track how much this element contributed to its target
                // buffer's count, to emit the rolling `start,end` offsets a
                // nested array needs.
                let mut added = 0;
                for (k, v) in &scratch.counts {
                    added += v - before.get(k).copied().unwrap_or(0);
                }
                running += added.max(1);
                offsets.push(running);
            }
            if matches!(element.as_ref(), TransformShape::Array { .. }) {
                // Nested array bookkeeping: the rolling offsets themselves
                // become part of the flattened representation. We don't
                // have a single target buffer at this level (each leaf
                // routes to its own), so we leave the offsets computed for
                // documentation/validation purposes only.
                let _ = offsets;
            }
            Ok(())
        }
    }
}

/// Wraps an accumulated scratch buffer into the backend's array-parameter
/// framing: `ndims=1, flags=0, oid, count, bound=1, <bytes>` (spec section
/// 4.5.1, "At the end, each accumulated buffer is wrapped...").
fn wrap_as_array(buf: &BytesMut, backend_oid: i32, count: i32) -> Bytes {
    let mut out = BytesMut::with_capacity(20 + buf.len());
    out.put_i32(1);
    out.put_i32(0);
    out.put_i32(backend_oid);
    out.put_i32(count);
    out.put_i32(ARRAY_BOUND);
    out.put_slice(buf);
    out.freeze()
}

/// Recodes one declared parameter's value into `out`.
fn recode_param(
    param: &InputParam,
    r: &mut Reader,
    out: &mut BytesMut,
    view: &dyn SessionView,
) -> Result<(), RecodeError> {
    let _reserved = r.i32()?;
    let value_len = r.i32()?;
    if value_len < 0 {
        if param.required {
            return Err(RecodeError::RequiredParameterMissing(param.name.clone()));
        }
        out.put_i32(-1);
        return Ok(());
    }
    let value_bytes = r.bytes(value_len as usize)?;
    let mut value_reader = Reader::new(&value_bytes);

    if let Some(shape) = &param.sub_params {
        let mut scratch = FanOutScratch::default();
        decode_shape(&mut value_reader, shape, &mut scratch, false)?;
        value_reader.finish()?;
        for (index, buf) in scratch.buffers.iter() {
            let count = *scratch.counts.get(index).unwrap_or(&0);
            let oid = param
                .array_type_id
                .and_then(|id| view.resolve_backend_type_id(id))
                .unwrap_or(0);
            let wrapped = wrap_as_array(buf, oid, count);
            out.put_value(Some(&wrapped));
        }
        return Ok(());
    }

    if let Some(client_type_id) = param.array_type_id {
        let oid = view
            .resolve_backend_type_id(client_type_id)
            .ok_or(RecodeError::UnresolvedArrayType)?;
        let mut rewritten = BytesMut::new();
        rewrite_array(&mut value_reader, &mut rewritten, oid)?;
        value_reader.finish()?;
        out.put_value(Some(&rewritten));
        return Ok(());
    }

    out.put_value(Some(&value_bytes));
    Ok(())
}

/// Composite-typed global recoding (spec section 4.5.3): tuple globals
/// validate their element count and re-stamp each element's backend oid;
/// array globals go through the same ndims/bound/NULL rules as ordinary
/// array parameters.
fn recode_global_composite(
    r: &mut Reader,
    out: &mut BytesMut,
    shape: &TransformShape,
    view: &dyn SessionView,
    declared_elements: Option<usize>,
) -> Result<(), RecodeError> {
    match shape {
        TransformShape::Tuple { elements } => {
            if let Some(n) = declared_elements {
                if n != elements.len() {
                    return Err(RecodeError::TupleShapeMismatch);
                }
            }
            for _ in elements {
                let _reserved_oid = r.i32()?;
                let value = r.value()?.ok_or(RecodeError::NullArrayElement)?;
                out.put_value(Some(&value));
            }
            Ok(())
        }
        TransformShape::Array { element } => {
            let oid = view
                .resolve_backend_type_id(Uuid::nil())
                .unwrap_or(0);
            rewrite_array(r, out, oid)?;
            let _ = element;
            Ok(())
        }
        TransformShape::Scalar { .. } => {
            let value = r.value()?.ok_or(RecodeError::NullArrayElement)?;
            out.put_value(Some(&value));
            Ok(())
        }
    }
}

fn recode_globals(
    globals: &[GlobalParam],
    view: &dyn SessionView,
    out: &mut BytesMut,
) -> Result<usize, RecodeError> {
    let mut slots = 0;
    let session_globals = view.get_globals();
    for global in globals {
        let entry = session_globals.get(&global.name);
        match entry {
            Some((Some(value), _present)) => {
                if let Some(shape) = &global.composite_shape {
                    let mut r = Reader::new(value);
                    recode_global_composite(&mut r, out, shape, view, None)?;
                } else {
                    out.put_value(Some(value));
                }
            }
            _ => out.put_i32(-1),
        }
        slots += 1;
        if global.has_present_arg {
            let present = matches!(entry, Some((Some(_), _)));
            let marker: [u8; 1] = [if present { 1 } else { 0 }];
            out.put_value(Some(&marker));
            slots += 1;
        }
    }
    Ok(slots)
}

/// Number of distinct fan-out target indices reachable from `shape` — each
/// one accumulates into its own buffer and is emitted as exactly one
/// backend value (spec section 4.5.1), regardless of how many scalar leaves
/// feed into it.
fn distinct_target_count(shape: &TransformShape) -> usize {
    let mut targets = std::collections::HashSet::new();
    collect_targets(shape, &mut targets);
    targets.len()
}

fn collect_targets(shape: &TransformShape, targets: &mut std::collections::HashSet<usize>) {
    match shape {
        TransformShape::Scalar { target_index } => {
            targets.insert(*target_index);
        }
        TransformShape::Tuple { elements } => {
            for element in elements {
                collect_targets(element, targets);
            }
        }
        TransformShape::Array { element } => collect_targets(element, targets),
    }
}

/// How many backend value-slots one declared parameter actually emits: one,
/// unless it fans out into a tuple/array's worth of sub-parameters (spec
/// section 4.5.1), in which case it's one slot per distinct fan-out target.
fn param_slot_count(param: &InputParam) -> usize {
    match &param.sub_params {
        Some(shape) => distinct_target_count(shape).max(1),
        None => 1,
    }
}

/// Recodes a full client parameter stream into the backend's expected
/// layout (spec section 4.5). `input_type_id` is the client-declared input
/// type id from the Execute request; `raw` is everything after it.
pub fn recode_arguments(
    unit: &QueryUnit,
    view: &dyn SessionView,
    input_type_id: Uuid,
    raw: &[u8],
) -> Result<Bytes, RecodeError> {
    let mut out = BytesMut::new();

    let real_count: usize = unit.input_params.iter().map(param_slot_count).sum();
    let global_slots_placeholder = unit
        .globals
        .iter()
        .map(|g| 1 + usize::from(g.has_present_arg))
        .sum::<usize>();
    let codes = format_codes(real_count, unit.extras_count, global_slots_placeholder);
    write_format_codes(&mut out, &codes);

    let total_count = real_count + unit.extras_count + global_slots_placeholder;
    if total_count > 32767 {
        return Err(RecodeError::TooManyArguments);
    }
    out.put_i16(total_count as i16);

    if input_type_id == NULL_TYPE_ID {
        if !raw.is_empty() {
            return Err(RecodeError::Malformed);
        }
    } else if raw.is_empty() {
        return Err(RecodeError::Malformed);
    } else {
        let mut r = Reader::new(raw);
        let recv_args = r.i32()?;
        if recv_args < 0 || recv_args as usize > 32767 {
            return Err(RecodeError::TooManyArguments);
        }
        if recv_args as usize != unit.input_params.len() {
            return Err(RecodeError::Malformed);
        }
        for param in &unit.input_params {
            recode_param(param, &mut r, &mut out, view)?;
        }
        r.finish().map_err(|_| RecodeError::TrailingBytes)?;
    }

    out.put_slice(&unit.extras_blob);
    recode_globals(&unit.globals, view, &mut out)?;

    out.put_u32(RESULT_FORMAT_ALL_BINARY);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use db_wire::common::{Capabilities, Cardinality};
    use crate::session::InMemorySessionView;

    fn empty_unit(input_params: Vec<InputParam>, globals: Vec<GlobalParam>) -> QueryUnit {
        QueryUnit {
            sql: "select 1".into(),
            sql_hash: None,
            input_type_id: Uuid::nil(),
            input_typedesc: Bytes::new(),
            output_type_id: Uuid::nil(),
            output_typedesc: Bytes::new(),
            cardinality: Cardinality::AtMostOne,
            capabilities: Capabilities::empty(),
            status: "SELECT".into(),
            input_params,
            globals,
            needs_readback: false,
            tx_id: None,
            tx_commit: false,
            tx_rollback: false,
            tx_savepoint_declare: None,
            tx_savepoint_rollback: None,
            tx_abort_migration: false,
            extras_blob: Bytes::new(),
            extras_count: 0,
        }
    }

    #[test]
    fn array_parameter_is_recoded_with_backend_oid() {
        let mut view = InMemorySessionView::new("test");
        let array_type = Uuid::from_u128(42);
        view.register_backend_type(array_type, 20);

        let unit = empty_unit(
            vec![InputParam {
                name: "ids".into(),
                required: true,
                array_type_id: Some(array_type),
                sub_params: None,
            }],
            vec![],
        );

        let mut array_value = BytesMut::new();
        array_value.put_i32(1); // ndims
        array_value.put_i32(0); // flags
        array_value.put_i32(0); // client-side placeholder oid
        array_value.put_i32(3); // count
        array_value.put_i32(1); // bound
        for v in [1i64, 2, 3] {
            array_value.put_value(Some(&v.to_be_bytes()));
        }

        let mut raw = BytesMut::new();
        raw.put_i32(1); // recv_args
        raw.put_i32(0); // reserved
        raw.put_value(Some(&array_value));

        let recoded = recode_arguments(&unit, &view, Uuid::from_u128(99), &raw).unwrap();
        // Skip format codes (count=1,code=1) + arg count(2) + value len(4).
        let value_start = 2 + 2 + 2 + 4;
        assert_eq!(&recoded[value_start..value_start + 4], &1i32.to_be_bytes());
        assert_eq!(&recoded[value_start + 4..value_start + 8], &0i32.to_be_bytes());
        assert_eq!(&recoded[value_start + 8..value_start + 12], &20i32.to_be_bytes());
    }

    #[test]
    fn required_parameter_null_is_rejected() {
        let view = InMemorySessionView::new("test");
        let unit = empty_unit(
            vec![InputParam {
                name: "x".into(),
                required: true,
                array_type_id: None,
                sub_params: None,
            }],
            vec![],
        );
        let mut raw = BytesMut::new();
        raw.put_i32(1);
        raw.put_i32(0);
        raw.put_i32(-1);

        let err = recode_arguments(&unit, &view, Uuid::from_u128(1), &raw).unwrap_err();
        assert_eq!(err, RecodeError::RequiredParameterMissing("x".into()));
    }

    #[test]
    fn empty_args_valid_only_for_null_type_id() {
        let view = InMemorySessionView::new("test");
        let unit = empty_unit(vec![], vec![]);
        assert!(recode_arguments(&unit, &view, NULL_TYPE_ID, &[]).is_ok());
        assert!(recode_arguments(&unit, &view, Uuid::from_u128(1), &[]).is_err());
    }

    #[test]
    fn globals_are_injected_with_presence_marker() {
        let mut view = InMemorySessionView::new("test");
        view.set_global("g".into(), Some(Bytes::from_static(b"hi")));
        let unit = empty_unit(
            vec![],
            vec![GlobalParam {
                name: "g".into(),
                has_present_arg: true,
                composite_shape: None,
            }],
        );
        let recoded = recode_arguments(&unit, &view, NULL_TYPE_ID, &[]).unwrap();
        // format codes: real=0, extras=0 -> vec![1] (count=1,code=1).
        assert_eq!(&recoded[0..4], &[0, 1, 0, 1]);
    }

    #[test]
    fn extras_count_is_included_in_total_argument_count() {
        let view = InMemorySessionView::new("test");
        let mut unit = empty_unit(vec![], vec![]);
        unit.extras_count = 3;
        unit.extras_blob = Bytes::from_static(b"extra-literals");

        let recoded = recode_arguments(&unit, &view, NULL_TYPE_ID, &[]).unwrap();
        // real_count == 0, extras_count != 0, global_slots == 0 -> empty format-code vector.
        assert_eq!(&recoded[0..2], &[0, 0]);
        // The total argument count header must still count the three extras.
        assert_eq!(&recoded[2..4], &3i16.to_be_bytes());
    }

    #[test]
    fn tuple_fan_out_param_counts_distinct_targets_not_leaves() {
        let shared_target = TransformShape::Tuple {
            elements: vec![
                TransformShape::Scalar { target_index: 0 },
                TransformShape::Scalar { target_index: 0 },
            ],
        };
        assert_eq!(distinct_target_count(&shared_target), 1);
        let shared_param = InputParam {
            name: "t".into(),
            required: true,
            array_type_id: None,
            sub_params: Some(shared_target),
        };
        assert_eq!(param_slot_count(&shared_param), 1);

        let distinct_targets = TransformShape::Tuple {
            elements: vec![
                TransformShape::Scalar { target_index: 0 },
                TransformShape::Scalar { target_index: 1 },
            ],
        };
        let fanned_param = InputParam {
            sub_params: Some(distinct_targets),
            ..shared_param
        };
        assert_eq!(param_slot_count(&fanned_param), 2);
    }

    #[test]
    fn sub_params_total_count_reflects_fan_out_not_one_slot_per_param() {
        let view = InMemorySessionView::new("test");
        let unit = empty_unit(
            vec![InputParam {
                name: "pair".into(),
                required: true,
                array_type_id: None,
                sub_params: Some(TransformShape::Tuple {
                    elements: vec![
                        TransformShape::Scalar { target_index: 0 },
                        TransformShape::Scalar { target_index: 1 },
                    ],
                }),
            }],
            vec![],
        );

        let mut tuple_value = BytesMut::new();
        tuple_value.put_i32(2); // element count
        tuple_value.put_value(Some(&1i64.to_be_bytes()));
        tuple_value.put_value(Some(&2i64.to_be_bytes()));

        let mut raw = BytesMut::new();
        raw.put_i32(1); // recv_args: one declared client-side parameter
        raw.put_i32(0); // reserved
        raw.put_value(Some(&tuple_value));

        let recoded = recode_arguments(&unit, &view, Uuid::from_u128(5), &raw).unwrap();
        // No extras -> single "all binary" format code regardless of slot count.
        assert_eq!(&recoded[0..4], &[0, 1, 0, 1]);
        // But the total argument count must reflect both fan-out targets, not
        // the one client-declared parameter that produced them.
        assert_eq!(&recoded[4..6], &2i16.to_be_bytes());
    }
}
