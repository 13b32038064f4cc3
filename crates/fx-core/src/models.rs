use serde::{Deserialize, Serialize};

/// A tradeable instrument. `id` is the 1-based position of `name` in the
/// configured asset list, assigned once at initialization and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: i32,
    pub name: String,
}

/// One observed (asset, time) rate. `value` is the mid-price, the average
/// of the upstream bid/ask quoted at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: i64,
    pub asset_id: i32,
    pub time: i64,
    pub value: f64,
}
