use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, Serializer};

use crate::graph::BlockId;
use crate::util::fast_map::FastHashMap;

/// String-keyed map payload. Keys that arrive as non-string values (loop
/// indices, case indices) are rendered through [`Val::state_key`] first.
pub type MapVal = FastHashMap<Arc<str>, Val>;

/// Runtime type of a [`Val`], used for cast checks and method dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Any,
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Block,
    Module,
    Closure,
    Type,
}

impl TypeTag {
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Any => "any",
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "string",
            TypeTag::List => "list",
            TypeTag::Map => "map",
            TypeTag::Block => "block",
            TypeTag::Module => "module",
            TypeTag::Closure => "closure",
            TypeTag::Type => "type",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A closure: a block reference plus the captured values, copied at the
/// moment the closure was made.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureVal {
    pub block: BlockId,
    pub bindings: Vec<Val>,
}

/// The tagged dynamic value.
///
/// Strings and containers are behind `Arc` so that slot copies are cheap;
/// mutation goes through `Arc::make_mut` and clones only when shared.
#[derive(Debug, Clone, Default)]
pub enum Val {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<Vec<Val>>),
    Map(Arc<MapVal>),
    Block(BlockId),
    Type(TypeTag),
    Module(Arc<str>),
    Closure(Arc<ClosureVal>),
}

impl Val {
    pub fn str(s: impl Into<Arc<str>>) -> Val {
        Val::Str(s.into())
    }

    pub fn list(items: Vec<Val>) -> Val {
        Val::List(Arc::new(items))
    }

    pub fn empty_map() -> Val {
        Val::Map(Arc::new(MapVal::default()))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Val::Null => TypeTag::Null,
            Val::Bool(_) => TypeTag::Bool,
            Val::Int(_) => TypeTag::Int,
            Val::Float(_) => TypeTag::Float,
            Val::Str(_) => TypeTag::Str,
            Val::List(_) => TypeTag::List,
            Val::Map(_) => TypeTag::Map,
            Val::Block(_) => TypeTag::Block,
            Val::Type(_) => TypeTag::Type,
            Val::Module(_) => TypeTag::Module,
            Val::Closure(_) => TypeTag::Closure,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Val::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::Int(i) => Some(*i as f64),
            Val::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Val]> {
        match self {
            Val::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapVal> {
        match self {
            Val::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<BlockId> {
        match self {
            Val::Block(b) => Some(*b),
            _ => None,
        }
    }

    /// Cast toward `tag`, the check behind typed input placeholders.
    /// Int widens to float; everything passes an `any` cast; no other
    /// coercions.
    pub fn cast(self, tag: TypeTag) -> Option<Val> {
        if tag == TypeTag::Any || self.type_tag() == tag {
            return Some(self);
        }
        match (self, tag) {
            (Val::Int(i), TypeTag::Float) => Some(Val::Float(i as f64)),
            _ => None,
        }
    }

    /// Render this value as a state-frame key.
    pub fn state_key(&self) -> Arc<str> {
        match self {
            Val::Str(s) => s.clone(),
            Val::Int(i) => {
                let mut buf = itoa::Buffer::new();
                Arc::from(buf.format(*i))
            }
            Val::Bool(b) => Arc::from(if *b { "true" } else { "false" }),
            other => Arc::from(other.to_string().as_str()),
        }
    }
}

/// Plain-data serialization for persisting state snapshots: containers
/// become JSON containers, reference values (blocks, types, modules,
/// closures) become their display strings.
impl Serialize for Val {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Val::Null => s.serialize_unit(),
            Val::Bool(b) => s.serialize_bool(*b),
            Val::Int(i) => s.serialize_i64(*i),
            Val::Float(x) => s.serialize_f64(*x),
            Val::Str(v) => s.serialize_str(v),
            Val::List(items) => s.collect_seq(items.iter()),
            Val::Map(m) => s.collect_map(m.iter()),
            other => s.serialize_str(&other.to_string()),
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Val) -> bool {
        match (self, other) {
            (Val::Null, Val::Null) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => *a as f64 == *b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => a == b,
            (Val::Map(a), Val::Map(b)) => a == b,
            (Val::Block(a), Val::Block(b)) => a == b,
            (Val::Type(a), Val::Type(b)) => a == b,
            (Val::Module(a), Val::Module(b)) => a == b,
            (Val::Closure(a), Val::Closure(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Val {
    fn from(i: i64) -> Val {
        Val::Int(i)
    }
}

impl From<f64> for Val {
    fn from(f: f64) -> Val {
        Val::Float(f)
    }
}

impl From<bool> for Val {
    fn from(b: bool) -> Val {
        Val::Bool(b)
    }
}

impl From<&str> for Val {
    fn from(s: &str) -> Val {
        Val::str(s)
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Null => f.write_str("null"),
            Val::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Val::Int(i) => {
                let mut buf = itoa::Buffer::new();
                f.write_str(buf.format(*i))
            }
            Val::Float(x) => {
                let mut buf = ryu::Buffer::new();
                f.write_str(buf.format(*x))
            }
            Val::Str(s) => f.write_str(s),
            Val::List(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Val::Map(m) => {
                let mut keys: Vec<&Arc<str>> = m.keys().collect();
                keys.sort();
                f.write_str("{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {}", m[*k])?;
                }
                f.write_str("}")
            }
            Val::Block(b) => write!(f, "<block {}>", b.index()),
            Val::Type(t) => write!(f, "<type {t}>"),
            Val::Module(name) => write!(f, "<module {name}>"),
            Val::Closure(c) => write!(f, "<closure block {}>", c.block.index()),
        }
    }
}
