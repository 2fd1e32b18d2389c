use std::collections::BTreeMap;

use crate::error::LicensingError;
use crate::types::{Grant, ObjectKey, RequestSpec};

/// Pure grant selection for the Discover phase.
pub struct GrantMatcher;

impl GrantMatcher {
    /// Picks the first grant, in grant-id order, that is available to
    /// `request`, offers the requested unit, and covers the requested amount.
    ///
    /// A grant already reserved for `request` counts as available so that a
    /// reservation left behind by an interrupted handshake is offered again
    /// instead of leaking.
    pub fn select<'a>(
        request: &ObjectKey,
        spec: &RequestSpec,
        grants: &'a BTreeMap<String, Grant>,
    ) -> Result<&'a Grant, LicensingError> {
        // BTreeMap iteration is ordered by grant id, so ties resolve the same way every pass.
        grants
            .values()
            .filter(|g| g.is_available_for(request))
            .filter(|g| g.unit == spec.unit)
            .find(|g| g.amount >= spec.amount)
            .ok_or_else(|| LicensingError::NoMatchingGrant {
                unit: spec.unit.clone(),
                amount: spec.amount,
            })
    }
}
