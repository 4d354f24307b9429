//! JSON store over `serde_json::Value`, key order preserved

use leafseal_core::{SealError, SealResult, METADATA_KEY};
use leafseal_crypto::Scalar;
use leafseal_keys::KeyContext;
use leafseal_tree::{Tree, TreeBranch, TreeItem, TreeKey, TreeValue};
use serde_json::{Map, Number, Value};

use crate::metadata::StoredMetadata;
use crate::{emit_error, parse_error, Store};

const FORMAT: &str = "JSON";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

fn parse_object(input: &[u8]) -> SealResult<Map<String, Value>> {
    match serde_json::from_slice(input).map_err(|e| parse_error(FORMAT, e))? {
        Value::Object(map) => Ok(map),
        _ => Err(SealError::config("top-level JSON value must be an object")),
    }
}

fn number(n: &Number) -> SealResult<Scalar> {
    if let Some(i) = n.as_i64() {
        return Ok(Scalar::Int(i.into()));
    }
    if let Some(u) = n.as_u64() {
        return Ok(Scalar::Int(u.into()));
    }
    n.as_f64()
        .map(Scalar::Float)
        .ok_or_else(|| SealError::config(format!("unsupported JSON number {n}")))
}

fn integer(i: i128) -> SealResult<Number> {
    if let Ok(signed) = i64::try_from(i) {
        return Ok(signed.into());
    }
    u64::try_from(i)
        .map(Number::from)
        .map_err(|_| emit_error(FORMAT, format!("integer {i} is out of range")))
}

fn object_to_branch(map: Map<String, Value>) -> SealResult<TreeBranch> {
    map.into_iter()
        .map(|(key, value)| Ok(TreeItem::named(key, value_to_tree(value)?)))
        .collect()
}

fn value_to_tree(value: Value) -> SealResult<TreeValue> {
    Ok(match value {
        Value::Null => Scalar::Null.into(),
        Value::Bool(b) => Scalar::Bool(b).into(),
        Value::Number(n) => number(&n)?.into(),
        Value::String(s) => Scalar::Str(s).into(),
        Value::Array(items) => TreeValue::Sequence(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| Ok(TreeItem::indexed(i, value_to_tree(item)?)))
                .collect::<SealResult<_>>()?,
        ),
        Value::Object(map) => TreeValue::Mapping(object_to_branch(map)?),
    })
}

fn scalar_to_value(scalar: &Scalar) -> SealResult<Value> {
    Ok(match scalar {
        Scalar::Str(s) => Value::String(s.clone()),
        Scalar::Int(i) => Value::Number(integer(*i)?),
        Scalar::Float(f) => Value::Number(
            Number::from_f64(*f)
                .ok_or_else(|| emit_error(FORMAT, format!("{f} is not representable")))?,
        ),
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Null => Value::Null,
    })
}

fn branch_to_object(branch: &TreeBranch) -> SealResult<Map<String, Value>> {
    let mut map = Map::new();
    for item in branch.iter() {
        let key = match &item.key {
            TreeKey::Name(name) => name.clone(),
            TreeKey::Index(index) => index.to_string(),
            TreeKey::Comment => continue,
        };
        if let Some(value) = tree_to_value(&item.value)? {
            map.insert(key, value);
        }
    }
    Ok(map)
}

fn tree_to_value(value: &TreeValue) -> SealResult<Option<Value>> {
    Ok(match value {
        TreeValue::Scalar(scalar) => Some(scalar_to_value(scalar)?),
        TreeValue::Mapping(branch) => Some(Value::Object(branch_to_object(branch)?)),
        TreeValue::Sequence(branch) => {
            let mut items = Vec::with_capacity(branch.len());
            for item in branch.iter() {
                if let Some(value) = tree_to_value(&item.value)? {
                    items.push(value);
                }
            }
            Some(Value::Array(items))
        }
        TreeValue::Comment(_) => None,
    })
}

/// Parse one JSON value, such as the argument of `leafseal set`.
pub fn parse_value(input: &str) -> SealResult<TreeValue> {
    let value: Value = serde_json::from_str(input).map_err(|e| parse_error(FORMAT, e))?;
    value_to_tree(value)
}

fn emit(value: &Value) -> SealResult<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(value).map_err(|e| emit_error(FORMAT, e))?;
    out.push(b'\n');
    Ok(out)
}

fn single(branches: &[TreeBranch]) -> SealResult<&TreeBranch> {
    match branches {
        [branch] => Ok(branch),
        _ => Err(SealError::config(format!(
            "JSON holds exactly one document, got {}",
            branches.len()
        ))),
    }
}

impl Store for JsonStore {
    fn load_plain_file(&self, input: &[u8]) -> SealResult<Vec<TreeBranch>> {
        let map = parse_object(input)?;
        if map.contains_key(METADATA_KEY) {
            return Err(SealError::config("document already contains sops metadata"));
        }
        Ok(vec![object_to_branch(map)?])
    }

    fn load_encrypted_file(&self, input: &[u8], ctx: &KeyContext) -> SealResult<Tree> {
        let mut map = parse_object(input)?;
        let stored: StoredMetadata = match map.shift_remove(METADATA_KEY) {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| parse_error("sops metadata", e))?
            }
            None => return Err(SealError::MetadataNotFound),
        };
        Ok(Tree::new(
            vec![object_to_branch(map)?],
            stored.into_metadata(ctx)?,
        ))
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> SealResult<Vec<u8>> {
        let mut map = branch_to_object(single(&tree.branches)?)?;
        let stored = StoredMetadata::from_metadata(&tree.metadata)?;
        map.insert(
            METADATA_KEY.into(),
            serde_json::to_value(&stored).map_err(|e| emit_error(FORMAT, e))?,
        );
        emit(&Value::Object(map))
    }

    fn emit_plain_file(&self, branches: &[TreeBranch]) -> SealResult<Vec<u8>> {
        emit(&Value::Object(branch_to_object(single(branches)?)?))
    }

    fn emit_value(&self, value: &TreeValue) -> SealResult<Vec<u8>> {
        match value {
            TreeValue::Scalar(Scalar::Str(s)) => Ok(s.clone().into_bytes()),
            other => match tree_to_value(other)? {
                Some(value) => emit(&value),
                None => Ok(Vec::new()),
            },
        }
    }
}
