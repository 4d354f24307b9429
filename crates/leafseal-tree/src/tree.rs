use leafseal_core::{SealError, SealResult};
use leafseal_crypto::Scalar;

use crate::metadata::Metadata;
use crate::path::{PathSegment, TreePath};

/// Position of an item inside its parent branch. Never encrypted.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeKey {
    /// Mapping key
    Name(String),
    /// Sequence position
    Index(usize),
    /// Comment line; takes no part in paths, encryption, or the MAC
    Comment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeValue {
    Scalar(Scalar),
    Mapping(TreeBranch),
    Sequence(TreeBranch),
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeItem {
    pub key: TreeKey,
    pub value: TreeValue,
}

/// An ordered run of items: a document root, a mapping, or a sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeBranch {
    pub items: Vec<TreeItem>,
}

/// A parsed document together with its encryption metadata.
#[derive(Debug)]
pub struct Tree {
    pub branches: Vec<TreeBranch>,
    pub metadata: Metadata,
}

impl TreeItem {
    pub fn named(key: impl Into<String>, value: impl Into<TreeValue>) -> Self {
        Self {
            key: TreeKey::Name(key.into()),
            value: value.into(),
        }
    }

    pub fn indexed(index: usize, value: impl Into<TreeValue>) -> Self {
        Self {
            key: TreeKey::Index(index),
            value: value.into(),
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            key: TreeKey::Comment,
            value: TreeValue::Comment(text.into()),
        }
    }
}

impl TreeValue {
    /// A sequence whose items are keyed by position.
    pub fn sequence<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<TreeValue>,
    {
        TreeValue::Sequence(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| TreeItem::indexed(i, v))
                .collect(),
        )
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            TreeValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_branch(&self) -> Option<&TreeBranch> {
        match self {
            TreeValue::Mapping(b) | TreeValue::Sequence(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Scalar> for TreeValue {
    fn from(value: Scalar) -> Self {
        TreeValue::Scalar(value)
    }
}

impl From<&str> for TreeValue {
    fn from(value: &str) -> Self {
        TreeValue::Scalar(Scalar::Str(value.to_string()))
    }
}

impl From<String> for TreeValue {
    fn from(value: String) -> Self {
        TreeValue::Scalar(Scalar::Str(value))
    }
}

impl From<i64> for TreeValue {
    fn from(value: i64) -> Self {
        TreeValue::Scalar(Scalar::Int(value.into()))
    }
}

impl From<f64> for TreeValue {
    fn from(value: f64) -> Self {
        TreeValue::Scalar(Scalar::Float(value))
    }
}

impl From<bool> for TreeValue {
    fn from(value: bool) -> Self {
        TreeValue::Scalar(Scalar::Bool(value))
    }
}

impl From<TreeBranch> for TreeValue {
    fn from(branch: TreeBranch) -> Self {
        TreeValue::Mapping(branch)
    }
}

impl FromIterator<TreeItem> for TreeBranch {
    fn from_iter<I: IntoIterator<Item = TreeItem>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl TreeBranch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: TreeItem) {
        self.items.push(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Value under mapping key `name`.
    pub fn get(&self, name: &str) -> Option<&TreeValue> {
        self.items.iter().find_map(|item| match &item.key {
            TreeKey::Name(n) if n == name => Some(&item.value),
            _ => None,
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TreeValue> {
        self.items.iter_mut().find_map(|item| match &item.key {
            TreeKey::Name(n) if n == name => Some(&mut item.value),
            _ => None,
        })
    }

    fn child(&self, segment: &PathSegment) -> Option<&TreeValue> {
        self.items
            .iter()
            .find(|item| match (&item.key, segment) {
                (TreeKey::Name(n), PathSegment::Key(k)) => n == k,
                (TreeKey::Index(i), PathSegment::Index(j)) => i == j,
                _ => false,
            })
            .map(|item| &item.value)
    }

    fn child_mut(&mut self, segment: &PathSegment) -> Option<&mut TreeValue> {
        self.items
            .iter_mut()
            .find(|item| match (&item.key, segment) {
                (TreeKey::Name(n), PathSegment::Key(k)) => n == k,
                (TreeKey::Index(i), PathSegment::Index(j)) => i == j,
                _ => false,
            })
            .map(|item| &mut item.value)
    }

    /// Insert or replace the value at `path`.
    ///
    /// Every segment but the last must already exist. A new mapping key is
    /// appended; a sequence index may be one past the end to append.
    pub fn set(&mut self, path: &TreePath, value: TreeValue) -> SealResult<()> {
        let not_found = || SealError::PathNotFound(path.to_string());
        let (last, parents) = path
            .segments()
            .split_last()
            .ok_or_else(|| SealError::config("cannot replace the document root"))?;

        let mut branch = self;
        let mut sequence = false;
        for segment in parents {
            match branch.child_mut(segment) {
                Some(TreeValue::Mapping(child)) => {
                    branch = child;
                    sequence = false;
                }
                Some(TreeValue::Sequence(child)) => {
                    branch = child;
                    sequence = true;
                }
                _ => return Err(not_found()),
            }
        }
        if sequence != matches!(last, PathSegment::Index(_)) {
            return Err(not_found());
        }

        if let Some(slot) = branch.child_mut(last) {
            *slot = value;
            return Ok(());
        }
        let item = match last {
            PathSegment::Key(key) => TreeItem::named(key.clone(), value),
            PathSegment::Index(index) => {
                let len = branch
                    .iter()
                    .filter(|item| matches!(item.key, TreeKey::Index(_)))
                    .count();
                if *index != len {
                    return Err(not_found());
                }
                TreeItem::indexed(len, value)
            }
        };
        branch.push(item);
        Ok(())
    }

    /// The value at `path`, which must not be empty.
    pub fn truncate(&self, path: &TreePath) -> SealResult<&TreeValue> {
        let not_found = || SealError::PathNotFound(path.to_string());
        let (first, rest) = path.segments().split_first().ok_or_else(not_found)?;
        let mut value = self.child(first).ok_or_else(not_found)?;
        for segment in rest {
            value = value
                .as_branch()
                .and_then(|b| b.child(segment))
                .ok_or_else(not_found)?;
        }
        Ok(value)
    }
}

impl Tree {
    pub fn new(branches: Vec<TreeBranch>, metadata: Metadata) -> Self {
        Self { branches, metadata }
    }
}
