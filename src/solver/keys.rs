//! Variable keys and typed values of the pose graph.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use nalgebra::{DVector, Vector3, Vector6};

use crate::geometry::SE3;
use crate::imu::ImuBias;

/// Monotonically increasing index of a fused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StateIndex(pub u64);

impl StateIndex {
    pub const ZERO: StateIndex = StateIndex(0);

    pub fn next(self) -> Self {
        StateIndex(self.0 + 1)
    }

    /// Previous index, or `None` at zero.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(StateIndex)
    }
}

impl fmt::Display for StateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one variable: the pose, velocity or bias of a state.
///
/// Ordered by state index first so iteration walks the graph in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Pose(StateIndex),
    Velocity(StateIndex),
    Bias(StateIndex),
}

impl Key {
    pub fn index(&self) -> StateIndex {
        match *self {
            Key::Pose(i) | Key::Velocity(i) | Key::Bias(i) => i,
        }
    }

    /// Tangent-space dimension of the variable.
    pub fn dim(&self) -> usize {
        match self {
            Key::Pose(_) => 6,
            Key::Velocity(_) => 3,
            Key::Bias(_) => 6,
        }
    }

    /// Name of the value kind stored under this key.
    pub fn type_name(&self) -> &'static str {
        match self {
            Key::Pose(_) => "pose",
            Key::Velocity(_) => "velocity",
            Key::Bias(_) => "bias",
        }
    }

    fn sort_key(&self) -> (StateIndex, u8) {
        match *self {
            Key::Pose(i) => (i, 0),
            Key::Velocity(i) => (i, 1),
            Key::Bias(i) => (i, 2),
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Pose(i) => write!(f, "X{}", i),
            Key::Velocity(i) => write!(f, "V{}", i),
            Key::Bias(i) => write!(f, "B{}", i),
        }
    }
}

/// Value of one variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Pose(SE3),
    Velocity(Vector3<f64>),
    Bias(ImuBias),
}

impl Value {
    pub fn dim(&self) -> usize {
        match self {
            Value::Pose(_) => 6,
            Value::Velocity(_) => 3,
            Value::Bias(_) => 6,
        }
    }

    /// Whether this value may be stored under `key`.
    pub fn matches(&self, key: &Key) -> bool {
        matches!(
            (self, key),
            (Value::Pose(_), Key::Pose(_))
                | (Value::Velocity(_), Key::Velocity(_))
                | (Value::Bias(_), Key::Bias(_))
        )
    }

    /// Apply a tangent-space increment. `delta` must hold `self.dim()` entries.
    pub fn retract(&self, delta: &[f64]) -> Value {
        match self {
            Value::Pose(pose) => Value::Pose(pose.retract(&Vector6::from_column_slice(delta))),
            Value::Velocity(v) => Value::Velocity(v + Vector3::from_column_slice(delta)),
            Value::Bias(b) => {
                let d = Vector6::from_column_slice(delta);
                Value::Bias(ImuBias::from_vector(&(b.as_vector() + d)))
            }
        }
    }

    /// Tangent-space difference `other ⊖ self`.
    pub fn local(&self, other: &Value) -> Option<DVector<f64>> {
        match (self, other) {
            (Value::Pose(a), Value::Pose(b)) => Some(DVector::from_column_slice(a.local(b).as_slice())),
            (Value::Velocity(a), Value::Velocity(b)) => {
                Some(DVector::from_column_slice((b - a).as_slice()))
            }
            (Value::Bias(a), Value::Bias(b)) => Some(DVector::from_column_slice(
                (b.as_vector() - a.as_vector()).as_slice(),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Pose(p) => {
                let (r, pi, y) = p.rotation.euler_angles();
                write!(
                    f,
                    "t=[{:.4}, {:.4}, {:.4}] rpy=[{:.4}, {:.4}, {:.4}]",
                    p.translation.x, p.translation.y, p.translation.z, r, pi, y
                )
            }
            Value::Velocity(v) => write!(f, "v=[{:.4}, {:.4}, {:.4}]", v.x, v.y, v.z),
            Value::Bias(b) => write!(
                f,
                "ba=[{:.5}, {:.5}, {:.5}] bg=[{:.5}, {:.5}, {:.5}]",
                b.accel.x, b.accel.y, b.accel.z, b.gyro.x, b.gyro.y, b.gyro.z
            ),
        }
    }
}

/// Typed extraction of a [`Value`].
pub trait FromValue: Sized {
    const TYPE_NAME: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for SE3 {
    const TYPE_NAME: &'static str = "pose";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Pose(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vector3<f64> {
    const TYPE_NAME: &'static str = "velocity";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Velocity(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for ImuBias {
    const TYPE_NAME: &'static str = "bias";

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bias(b) => Some(*b),
            _ => None,
        }
    }
}

/// Ordered key → value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    inner: BTreeMap<Key, Value>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a value. Returns the previous value.
    pub fn insert(&mut self, key: Key, value: Value) -> Option<Value> {
        self.inner.insert(key, value)
    }

    pub fn insert_pose(&mut self, index: StateIndex, pose: SE3) {
        self.inner.insert(Key::Pose(index), Value::Pose(pose));
    }

    pub fn insert_velocity(&mut self, index: StateIndex, velocity: Vector3<f64>) {
        self.inner.insert(Key::Velocity(index), Value::Velocity(velocity));
    }

    pub fn insert_bias(&mut self, index: StateIndex, bias: ImuBias) {
        self.inner.insert(Key::Bias(index), Value::Bias(bias));
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.inner.get(key)
    }

    /// Typed lookup; `None` when absent or of a different kind.
    pub fn get_as<T: FromValue>(&self, key: &Key) -> Option<T> {
        self.inner.get(key).and_then(T::from_value)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.inner.keys()
    }

    /// Key with the highest state index.
    pub fn last_key(&self) -> Option<&Key> {
        self.inner.keys().next_back()
    }

    /// Entries whose state index is at least `index`.
    pub fn iter_from(&self, index: StateIndex) -> impl Iterator<Item = (&Key, &Value)> {
        self.inner.range(Key::Pose(index)..)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.inner.iter()
    }
}

impl IntoIterator for Values {
    type Item = (Key, Value);
    type IntoIter = std::collections::btree_map::IntoIter<Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_key_display() {
        let i = StateIndex(7);
        assert_eq!(Key::Pose(i).to_string(), "X7");
        assert_eq!(Key::Velocity(i).to_string(), "V7");
        assert_eq!(Key::Bias(i).to_string(), "B7");
    }

    #[test]
    fn test_keys_iterate_in_time_order() {
        let mut values = Values::new();
        values.insert_bias(StateIndex(1), ImuBias::zero());
        values.insert_pose(StateIndex(2), SE3::identity());
        values.insert_pose(StateIndex(0), SE3::identity());
        values.insert_velocity(StateIndex(1), Vector3::zeros());

        let keys: Vec<Key> = values.keys().copied().collect();
        let indices: Vec<u64> = keys.iter().map(|k| k.index().0).collect();
        assert_eq!(indices, vec![0, 1, 1, 2]);
        assert_eq!(keys[1], Key::Velocity(StateIndex(1)));
    }

    #[test]
    fn test_state_index_prev() {
        assert_eq!(StateIndex::ZERO.prev(), None);
        assert_eq!(StateIndex(3).prev(), Some(StateIndex(2)));
        assert_eq!(StateIndex(3).next(), StateIndex(4));
    }

    #[test]
    fn test_typed_lookup() {
        let mut values = Values::new();
        values.insert_velocity(StateIndex(0), Vector3::new(1.0, 2.0, 3.0));

        let v: Option<Vector3<f64>> = values.get_as(&Key::Velocity(StateIndex(0)));
        assert_eq!(v, Some(Vector3::new(1.0, 2.0, 3.0)));
        let wrong: Option<SE3> = values.get_as(&Key::Velocity(StateIndex(0)));
        assert!(wrong.is_none());
    }

    #[test]
    fn test_retract_then_local_recovers_delta() {
        let pose = Value::Pose(SE3::from_quaternion(
            0.9,
            0.1,
            -0.3,
            0.2,
            Vector3::new(1.0, -2.0, 0.5),
        ));
        let delta = DVector::from_vec(vec![0.01, -0.02, 0.03, 0.1, 0.2, -0.1]);

        let moved = pose.retract(delta.as_slice());
        let recovered = pose.local(&moved).unwrap();
        assert_relative_eq!(recovered, delta, epsilon = 1e-9);
    }
}
