//! The data model for compiled queries (spec section 3) and the external
//! compiler interface (spec section 4.8) that this engine drives but does
//! not implement — query compilation and planning are explicitly out of
//! scope.

use bytes::Bytes;
use uuid::Uuid;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use db_wire::common::{Capabilities, Cardinality, CompilationOptions, RawTypedesc, State};

/// A value-typed description of a query, sufficient to key the compile
/// cache (spec section 3).
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    pub source: String,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub schema_version: Uuid,
    pub options: CompilationOptionsKey,
    pub modaliases: Vec<(String, String)>,
}

/// The subset of [`CompilationOptions`] that participates in the cache key
/// (everything that could change the compiled plan).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilationOptionsKey {
    pub input_language: u8,
    pub output_format: u8,
    pub expected_cardinality: u8,
    pub implicit_limit: i64,
    pub flags: u64,
    pub allow_capabilities: u64,
}

impl From<&CompilationOptions> for CompilationOptionsKey {
    fn from(o: &CompilationOptions) -> Self {
        CompilationOptionsKey {
            input_language: o.input_language.to_wire(),
            output_format: o.io_format.to_wire(),
            expected_cardinality: o.expected_cardinality.to_wire(),
            implicit_limit: o.implicit_limit,
            flags: o.flags().bits(),
            allow_capabilities: o.allow_capabilities.bits(),
        }
    }
}

impl CompilationRequest {
    /// The request hash used for compile-cache lookups and for the
    /// last-anonymous-compile shortcut (spec section 8: "Parse immediately
    /// followed by Execute with identical request hash... no recompile").
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.source.hash(&mut hasher);
        self.protocol_major.hash(&mut hasher);
        self.protocol_minor.hash(&mut hasher);
        self.schema_version.hash(&mut hasher);
        self.options.hash(&mut hasher);
        self.modaliases.hash(&mut hasher);
        hasher.finish()
    }
}

/// A declared input parameter.
#[derive(Debug, Clone)]
pub struct InputParam {
    pub name: String,
    pub required: bool,
    /// Backend type id to resolve array elements against, if this parameter
    /// is an array.
    pub array_type_id: Option<Uuid>,
    /// Present when the parameter is an encoded tuple/array that must be
    /// fanned out into multiple backend sub-parameters (spec section 4.5.1).
    pub sub_params: Option<TransformShape>,
}

/// One recursive level of the tuple/array fan-out transformation.
#[derive(Debug, Clone)]
pub enum TransformShape {
    Scalar { target_index: usize },
    Tuple { elements: Vec<TransformShape> },
    Array { element: Box<TransformShape> },
}

/// A declared session global.
#[derive(Debug, Clone)]
pub struct GlobalParam {
    pub name: String,
    pub has_present_arg: bool,
    /// Some(shape) if the global's backend representation is a composite
    /// (tuple/array) type (spec section 4.5.3).
    pub composite_shape: Option<TransformShape>,
}

/// One atomic compiled step (spec section 3, "Unit / unit group").
#[derive(Debug, Clone)]
pub struct QueryUnit {
    pub sql: String,
    pub sql_hash: Option<String>,
    pub input_type_id: Uuid,
    pub input_typedesc: Bytes,
    pub output_type_id: Uuid,
    pub output_typedesc: Bytes,
    pub cardinality: Cardinality,
    pub capabilities: Capabilities,
    pub status: String,
    pub input_params: Vec<InputParam>,
    pub globals: Vec<GlobalParam>,
    pub needs_readback: bool,
    pub tx_id: Option<u64>,
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_declare: Option<String>,
    pub tx_savepoint_rollback: Option<String>,
    pub tx_abort_migration: bool,
    /// Compiler-extracted constant literals, appended verbatim to the
    /// recoded argument stream (spec section 4.5).
    pub extras_blob: Bytes,
    /// How many positional slots `extras_blob` occupies, needed to size the
    /// mixed-mode format-code vector without parsing the opaque blob.
    pub extras_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct UnitGroup {
    pub units: Vec<QueryUnit>,
}

impl UnitGroup {
    pub fn needs_script_execution(&self) -> bool {
        self.units.len() > 1 || self.units.iter().any(|u| u.needs_readback)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.units.len() == 1
            && (self.units[0].tx_abort_migration
                || self.units[0].tx_savepoint_rollback.is_some()
                || self.units[0].tx_rollback)
    }
}

/// A compilation request plus its resulting unit group (spec section 3).
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub request_hash: u64,
    pub units: UnitGroup,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DescribeOutcome {
    pub input_typedesc: RawTypedesc,
    pub output_typedesc: RawTypedesc,
    pub cardinality: Cardinality,
    pub capabilities: Capabilities,
    pub warnings: Vec<String>,
}

/// The external compiler interface (spec section 4.8, "consumed"). Query
/// compilation and planning are out of scope; this trait is the seam.
pub trait Compiler {
    type Error: std::error::Error + Send + Sync + 'static;

    fn compile(
        &self,
        request: &CompilationRequest,
        state: &State,
    ) -> Result<CompiledQuery, Self::Error>;
}
