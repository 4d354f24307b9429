//! YAML store over `serde_yml::Value`; every `---` document is a branch

use leafseal_core::{SealError, SealResult, METADATA_KEY};
use leafseal_crypto::Scalar;
use leafseal_keys::KeyContext;
use leafseal_tree::{Tree, TreeBranch, TreeItem, TreeKey, TreeValue};
use serde_yml::{Mapping, Number, Value};
use tracing::debug;

use crate::metadata::StoredMetadata;
use crate::{emit_error, parse_error, Store};

const FORMAT: &str = "YAML";

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlStore;

/// `---` at the start of a line, alone or followed by inline content.
fn is_marker(line: &str) -> bool {
    line.strip_prefix("---")
        .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t', '\r', '\n']))
}

/// True when some line is neither blank, a comment, a directive, nor a bare
/// document marker.
fn has_content(doc: &str) -> bool {
    doc.lines().any(|line| {
        let trimmed = line.trim();
        !(trimmed.is_empty()
            || trimmed.starts_with('#')
            || line.starts_with('%')
            || trimmed == "---"
            || trimmed == "...")
    })
}

/// Split a stream into its documents. A leading run of comments or
/// directives belongs to the first explicit document.
fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    let mut explicit = false;
    for line in text.split_inclusive('\n') {
        if is_marker(line) {
            if explicit || has_content(&current) {
                docs.push(std::mem::take(&mut current));
            }
            explicit = true;
        } else if line.trim_end() == "..." {
            if explicit || has_content(&current) {
                docs.push(std::mem::take(&mut current));
            }
            current.clear();
            explicit = false;
            continue;
        }
        current.push_str(line);
    }
    if explicit || has_content(&current) || docs.is_empty() {
        docs.push(current);
    }
    docs
}

fn documents(input: &[u8]) -> SealResult<Vec<Value>> {
    let text = std::str::from_utf8(input).map_err(|e| parse_error(FORMAT, e))?;
    split_documents(text)
        .iter()
        .map(|doc| {
            if has_content(doc) {
                serde_yml::from_str::<Value>(doc).map_err(|e| parse_error(FORMAT, e))
            } else {
                Ok(Value::Null)
            }
        })
        .collect()
}

fn top_level(doc: Value) -> SealResult<Mapping> {
    match doc {
        Value::Mapping(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        Value::Tagged(tagged) => {
            let (_, inner) = (*tagged).into_parts();
            top_level(inner)
        }
        _ => Err(SealError::config("top-level YAML document must be a mapping")),
    }
}

fn number(n: &Number) -> Scalar {
    match n.as_i64() {
        Some(i) => Scalar::Int(i.into()),
        None => Scalar::Float(n.as_f64()),
    }
}

fn mapping_to_branch(map: Mapping) -> SealResult<TreeBranch> {
    map.into_iter()
        .map(|(key, value)| Ok(TreeItem::named(key, value_to_tree(value)?)))
        .collect()
}

fn value_to_tree(value: Value) -> SealResult<TreeValue> {
    Ok(match value {
        Value::Null => Scalar::Null.into(),
        Value::Bool(b) => Scalar::Bool(b).into(),
        Value::Number(n) => number(&n).into(),
        Value::String(s) => Scalar::Str(s).into(),
        Value::Sequence(items) => TreeValue::Sequence(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| Ok(TreeItem::indexed(i, value_to_tree(item)?)))
                .collect::<SealResult<_>>()?,
        ),
        Value::Mapping(map) => TreeValue::Mapping(mapping_to_branch(map)?),
        Value::Tagged(tagged) => {
            let (_, inner) = (*tagged).into_parts();
            value_to_tree(inner)?
        }
    })
}

/// YAML integers are 64-bit signed; wider values are refused rather than
/// rounded through a float.
fn scalar_to_value(scalar: &Scalar) -> SealResult<Value> {
    Ok(match scalar {
        Scalar::Str(s) => Value::String(s.clone()),
        Scalar::Int(i) => {
            let i = i64::try_from(*i).map_err(|_| {
                emit_error(FORMAT, format!("integer {i} does not fit a 64-bit YAML integer"))
            })?;
            Value::Number(Number::from(i))
        }
        Scalar::Float(f) => Value::Number(Number::from(*f)),
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Null => Value::Null,
    })
}

fn branch_to_mapping(branch: &TreeBranch) -> SealResult<Mapping> {
    let mut map = Mapping::new();
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
        TreeValue::Mapping(branch) => Some(Value::Mapping(branch_to_mapping(branch)?)),
        TreeValue::Sequence(branch) => {
            let mut items = Vec::with_capacity(branch.len());
            for item in branch.iter() {
                if let Some(value) = tree_to_value(&item.value)? {
                    items.push(value);
                }
            }
            Some(Value::Sequence(items))
        }
        TreeValue::Comment(_) => None,
    })
}

fn emit_documents(docs: &[Value]) -> SealResult<Vec<u8>> {
    let mut out = String::new();
    for (i, doc) in docs.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yml::to_string(doc).map_err(|e| emit_error(FORMAT, e))?);
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    Ok(out.into_bytes())
}

impl Store for YamlStore {
    fn load_plain_file(&self, input: &[u8]) -> SealResult<Vec<TreeBranch>> {
        documents(input)?
            .into_iter()
            .map(|doc| {
                let map = top_level(doc)?;
                if map.contains_key(METADATA_KEY) {
                    return Err(SealError::config("document already contains sops metadata"));
                }
                mapping_to_branch(map)
            })
            .collect()
    }

    fn load_encrypted_file(&self, input: &[u8], ctx: &KeyContext) -> SealResult<Tree> {
        let mut stored = None;
        let mut branches = Vec::new();
        for doc in documents(input)? {
            let mut rest = Mapping::new();
            for (key, value) in top_level(doc)? {
                if key == METADATA_KEY {
                    stored.get_or_insert(value);
                } else {
                    rest.insert(key, value);
                }
            }
            branches.push(mapping_to_branch(rest)?);
        }

        let stored: StoredMetadata = match stored {
            Some(value) => serde_yml::from_value(value)
                .map_err(|e| parse_error("sops metadata", e))?,
            None => return Err(SealError::MetadataNotFound),
        };
        debug!(documents = branches.len(), "loaded encrypted YAML");
        Ok(Tree::new(branches, stored.into_metadata(ctx)?))
    }

    fn emit_encrypted_file(&self, tree: &Tree) -> SealResult<Vec<u8>> {
        let stored = StoredMetadata::from_metadata(&tree.metadata)?;
        let stored = serde_yml::to_value(&stored).map_err(|e| emit_error(FORMAT, e))?;
        let docs = tree
            .branches
            .iter()
            .map(|branch| {
                let mut map = branch_to_mapping(branch)?;
                map.insert(METADATA_KEY, stored.clone());
                Ok(Value::Mapping(map))
            })
            .collect::<SealResult<Vec<_>>>()?;
        emit_documents(&docs)
    }

    fn emit_plain_file(&self, branches: &[TreeBranch]) -> SealResult<Vec<u8>> {
        let docs = branches
            .iter()
            .map(|branch| branch_to_mapping(branch).map(Value::Mapping))
            .collect::<SealResult<Vec<_>>>()?;
        emit_documents(&docs)
    }

    fn emit_value(&self, value: &TreeValue) -> SealResult<Vec<u8>> {
        match value {
            TreeValue::Scalar(Scalar::Str(s)) => Ok(s.clone().into_bytes()),
            other => match tree_to_value(other)? {
                Some(value) => emit_documents(std::slice::from_ref(&value)),
                None => Ok(Vec::new()),
            },
        }
    }
}
