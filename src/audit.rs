//! Audit envelope embedded in every persisted record.
//!
//! Records own an [`Audit`] value instead of inheriting audit columns. The
//! transaction stamps it at write time through [`Audited`]: both fields on
//! insert, `modified_at` on update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl Audit {
    /// Stamp a freshly inserted record. An existing `created_at` is kept.
    pub fn stamp_created(&mut self, now: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.modified_at = Some(now);
    }

    pub fn stamp_modified(&mut self, now: DateTime<Utc>) {
        self.modified_at = Some(now);
    }
}

/// Access to the embedded audit value of a record.
pub trait Audited {
    fn audit(&self) -> &Audit;
    fn audit_mut(&mut self) -> &mut Audit;
}
