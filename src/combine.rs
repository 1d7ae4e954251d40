//! Joins segment and user features into one trainable row per receipt.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::features::FeatureSchema;
use crate::segment_features::SegmentFeatureRow;
use crate::user_features::UserFeatureRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainableTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TrainableTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

/// Left join of user features onto segment features by `receipt_key`.
/// Receipts without a user row get empty user cells.
pub fn combine_features(
    segment_schema: &FeatureSchema,
    segment_rows: &[SegmentFeatureRow],
    user_schema: &FeatureSchema,
    user_rows: &[UserFeatureRow],
) -> TrainableTable {
    let mut header = segment_schema.header();
    header.extend(user_schema.columns.iter().map(|c| c.name.clone()));

    let users: HashMap<i64, &UserFeatureRow> =
        user_rows.iter().map(|row| (row.receipt_key, row)).collect();
    let user_width = user_schema.columns.len();

    let mut unmatched = 0u64;
    let rows: Vec<Vec<String>> = segment_rows
        .iter()
        .map(|segment| {
            let mut cells = segment.cells();
            match users.get(&segment.receipt_key) {
                // Skip the user row's own receipt_key cell.
                Some(user) => cells.extend(user.cells().into_iter().skip(1)),
                None => {
                    unmatched += 1;
                    cells.extend(std::iter::repeat(String::new()).take(user_width));
                }
            }
            cells
        })
        .collect();

    if unmatched > 0 {
        warn!(
            component = "combine",
            event = "combine.unmatched_user_rows",
            unmatched
        );
    }
    info!(
        component = "combine",
        event = "combine.finish",
        rows = rows.len(),
        columns = header.len()
    );

    TrainableTable { header, rows }
}
