//! Render trees and the sparse diff between two renderings.
//!
//! A template rendering decomposes into alternating static spans and dynamic
//! holes. The statics depend only on the template, so for any two renderings
//! of the same template only the dynamics can differ. That invariant is what
//! makes the diff sparse: an update carries just the changed dynamic indices.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from applying a patch to a render tree.
#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
    /// A patch index does not exist in the target tree.
    #[error("patch index {0} out of range")]
    IndexOutOfRange(usize),

    /// A nested patch landed on a dynamic that is not a subtree.
    #[error("nested patch at index {0} targets a non-tree dynamic")]
    NotATree(usize),
}

/// One rendering of a template: static spans interleaved with dynamic holes.
///
/// Invariant: `statics.len() == dynamics.len() + 1`. The empty template is
/// `statics = [""]`, `dynamics = []`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTree {
    /// Fixed byte spans, identical across renderings of the same template.
    pub statics: Vec<String>,
    /// Data-dependent values, one per hole between consecutive statics.
    pub dynamics: Vec<Dynamic>,
}

/// A single dynamic value: rendered text, or a nested sub-template rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic {
    /// Rendered text.
    Text(String),
    /// A nested render tree from a sub-template or component.
    Tree(RenderTree),
}

impl RenderTree {
    /// The rendering of an empty template.
    pub fn empty() -> Self {
        Self {
            statics: vec![String::new()],
            dynamics: Vec::new(),
        }
    }

    /// Builds a tree, checking the statics/dynamics length invariant.
    pub fn new(statics: Vec<String>, dynamics: Vec<Dynamic>) -> Self {
        debug_assert_eq!(statics.len(), dynamics.len() + 1);
        Self { statics, dynamics }
    }

    /// Flattens the tree back into HTML, interleaving statics and dynamics.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for (i, s) in self.statics.iter().enumerate() {
            out.push_str(s);
            match self.dynamics.get(i) {
                Some(Dynamic::Text(t)) => out.push_str(t),
                Some(Dynamic::Tree(t)) => out.push_str(&t.to_html()),
                None => {}
            }
        }
        out
    }

    fn to_value(&self) -> Value {
        let dynamics: BTreeMap<usize, Value> = self
            .dynamics
            .iter()
            .enumerate()
            .map(|(i, d)| (i, d.to_value()))
            .collect();
        json!({ "s": self.statics, "d": dynamics })
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        let obj = value.as_object().ok_or("render tree must be an object")?;
        let statics: Vec<String> = obj
            .get("s")
            .and_then(Value::as_array)
            .ok_or("render tree missing statics")?
            .iter()
            .map(|s| s.as_str().map(str::to_owned).ok_or("static must be a string"))
            .collect::<Result<_, _>>()?;
        let holes = statics.len().saturating_sub(1);
        let map = obj
            .get("d")
            .and_then(Value::as_object)
            .ok_or("render tree missing dynamics")?;
        let mut dynamics = Vec::with_capacity(holes);
        for i in 0..holes {
            let v = map
                .get(&i.to_string())
                .ok_or_else(|| format!("render tree missing dynamic {i}"))?;
            dynamics.push(Dynamic::from_value(v)?);
        }
        Ok(Self { statics, dynamics })
    }
}

impl Dynamic {
    fn to_value(&self) -> Value {
        match self {
            Dynamic::Text(t) => Value::String(t.clone()),
            Dynamic::Tree(t) => t.to_value(),
        }
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(Dynamic::Text(s.clone())),
            Value::Object(_) => Ok(Dynamic::Tree(RenderTree::from_value(value)?)),
            other => Err(format!("invalid dynamic value: {other}")),
        }
    }
}

/// A sparse update: the dynamics that changed between two renderings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TreePatch(
    /// Changed dynamics keyed by their index.
    pub BTreeMap<usize, PatchValue>,
);

/// The new value for one changed dynamic.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    /// Replacement text.
    Text(String),
    /// Full subtree replacement, sent when the dynamic changed type or the
    /// subtree's statics changed.
    Tree(RenderTree),
    /// A nested sparse patch into an existing subtree.
    Patch(TreePatch),
}

impl TreePatch {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies this patch to `tree`, reproducing the newer rendering.
    pub fn apply(&self, tree: &mut RenderTree) -> Result<(), TreeError> {
        for (&i, value) in &self.0 {
            let slot = tree
                .dynamics
                .get_mut(i)
                .ok_or(TreeError::IndexOutOfRange(i))?;
            match value {
                PatchValue::Text(t) => *slot = Dynamic::Text(t.clone()),
                PatchValue::Tree(t) => *slot = Dynamic::Tree(t.clone()),
                PatchValue::Patch(p) => match slot {
                    Dynamic::Tree(sub) => p.apply(sub)?,
                    Dynamic::Text(_) => return Err(TreeError::NotATree(i)),
                },
            }
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        let map: BTreeMap<usize, Value> =
            self.0.iter().map(|(&i, v)| (i, v.to_value())).collect();
        json!({ "d": map })
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .and_then(|o| o.get("d"))
            .and_then(Value::as_object)
            .ok_or("patch must be an object with a dynamics map")?;
        let mut out = BTreeMap::new();
        for (k, v) in map {
            let i: usize = k.parse().map_err(|_| format!("bad patch index {k}"))?;
            out.insert(i, PatchValue::from_value(v)?);
        }
        Ok(Self(out))
    }
}

impl PatchValue {
    fn to_value(&self) -> Value {
        match self {
            PatchValue::Text(t) => Value::String(t.clone()),
            PatchValue::Tree(t) => t.to_value(),
            PatchValue::Patch(p) => p.to_value(),
        }
    }

    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(PatchValue::Text(s.clone())),
            // A subtree replacement carries its statics; a nested patch does not.
            Value::Object(o) if o.contains_key("s") => {
                Ok(PatchValue::Tree(RenderTree::from_value(value)?))
            }
            Value::Object(_) => Ok(PatchValue::Patch(TreePatch::from_value(value)?)),
            other => Err(format!("invalid patch value: {other}")),
        }
    }
}

/// The outcome of comparing two renderings.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Same template shape; only these dynamics changed (possibly none).
    Patch(TreePatch),
    /// The statics differ, so the newer tree must be sent as a fresh baseline.
    Reset(RenderTree),
}

/// Diffs two renderings of (what should be) the same template.
///
/// Returns [`Diff::Reset`] when the static lists differ, which signals a
/// structural change the client cannot patch around.
pub fn diff(prev: &RenderTree, next: &RenderTree) -> Diff {
    if prev.statics != next.statics {
        return Diff::Reset(next.clone());
    }
    let mut changes = BTreeMap::new();
    for (i, (p, n)) in prev.dynamics.iter().zip(&next.dynamics).enumerate() {
        match (p, n) {
            (Dynamic::Text(a), Dynamic::Text(b)) => {
                if a != b {
                    changes.insert(i, PatchValue::Text(b.clone()));
                }
            }
            (Dynamic::Tree(a), Dynamic::Tree(b)) => match diff(a, b) {
                Diff::Patch(p) if p.is_empty() => {}
                Diff::Patch(p) => {
                    changes.insert(i, PatchValue::Patch(p));
                }
                Diff::Reset(t) => {
                    changes.insert(i, PatchValue::Tree(t));
                }
            },
            // Type change: send a full replacement.
            (_, Dynamic::Text(b)) => {
                changes.insert(i, PatchValue::Text(b.clone()));
            }
            (_, Dynamic::Tree(b)) => {
                changes.insert(i, PatchValue::Tree(b.clone()));
            }
        }
    }
    Diff::Patch(TreePatch(changes))
}

impl Serialize for RenderTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RenderTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}

impl Serialize for TreePatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TreePatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}
