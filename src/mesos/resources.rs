//! Offer resource arithmetic.
//!
//! Offers advertise scalar resources (`cpus`, `mem`, `disk`) in shares that
//! may be statically reserved for a role. Matching needs three operations:
//!
//! - a containment check against the unreserved projection (can the offer
//!   cover the job at all),
//! - `find`: carving concrete shares out of the offer for a (possibly
//!   role-reserved) request, preferring shares reserved for the request's
//!   role,
//! - subtraction of the carved shares from what remains of the offer.
//!
//! Scalar comparisons use a small epsilon; offer values arrive as floats.

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-9;

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";

/// Scalar resource value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

/// Static or dynamic reservation attached to a resource share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Reservation {
    pub fn statically_for(role: &str) -> Self {
        Self {
            kind: Some("STATIC".to_string()),
            role: Some(role.to_string()),
        }
    }
}

/// Allocation role stamped onto offered resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// One resource share of an offer or a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,
    /// Pre-reservation-refinement role field; `*` means unreserved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<Reservation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_info: Option<AllocationInfo>,
}

impl Resource {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: "SCALAR".to_string(),
            scalar: Some(Scalar { value }),
            role: None,
            reservations: Vec::new(),
            allocation_info: None,
        }
    }

    pub fn value(&self) -> f64 {
        self.scalar.map(|s| s.value).unwrap_or(0.0)
    }

    fn set_value(&mut self, value: f64) {
        self.scalar = Some(Scalar { value });
    }

    /// The role this share is reserved for, if any. The refined
    /// `reservations` stack wins over the legacy `role` field; `*` counts
    /// as unreserved.
    pub fn reservation_role(&self) -> Option<&str> {
        if let Some(reservation) = self.reservations.last() {
            return reservation.role.as_deref();
        }
        match self.role.as_deref() {
            None | Some("*") => None,
            Some(role) => Some(role),
        }
    }
}

/// A bag of resource shares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(pub Vec<Resource>);

impl Resources {
    pub fn new(shares: Vec<Resource>) -> Self {
        Self(shares)
    }

    /// A plain unreserved {cpus, mem, disk} request.
    pub fn request(cpus: f64, mem: f64, disk: f64) -> Self {
        let mut shares = vec![Resource::scalar(CPUS, cpus), Resource::scalar(MEM, mem)];
        if disk > EPSILON {
            shares.push(Resource::scalar(DISK, disk));
        }
        Self(shares)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all shares of one resource, regardless of role.
    pub fn amount(&self, name: &str) -> f64 {
        self.0
            .iter()
            .filter(|r| r.name == name)
            .map(Resource::value)
            .sum()
    }

    /// Drop allocation roles (offered resources carry them, requests and
    /// launched tasks do not).
    pub fn unallocate(mut self) -> Self {
        for share in &mut self.0 {
            share.allocation_info = None;
        }
        self
    }

    /// Projection with all reservations stripped, for containment checks.
    pub fn to_unreserved(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|share| {
                    let mut share = share.clone();
                    share.reservations.clear();
                    share.role = None;
                    share
                })
                .collect(),
        )
    }

    /// Push a static reservation for `role` onto every share.
    pub fn push_reservation(mut self, role: &str) -> Self {
        for share in &mut self.0 {
            share.reservations.push(Reservation::statically_for(role));
        }
        self
    }

    /// True if this bag covers `other`, comparing per-name sums. Both sides
    /// are expected to be unreserved projections.
    pub fn contains_all(&self, other: &Resources) -> bool {
        let mut names: Vec<&str> = other.0.iter().map(|r| r.name.as_str()).collect();
        names.dedup();
        names
            .iter()
            .all(|name| self.amount(name) + EPSILON >= other.amount(name))
    }

    /// Carve shares for the request out of `available`.
    ///
    /// For each requested resource, shares reserved for the request's role
    /// are drawn first, then unreserved shares. Returns None if the request
    /// cannot be satisfied in full. Found shares keep the reservation of
    /// the offer share they came from, so a launch consumes the reserved
    /// capacity it matched.
    pub fn find(&self, available: &Resources) -> Option<Resources> {
        let mut remaining = available.clone();
        let mut found = Vec::new();
        for want in &self.0 {
            let mut needed = want.value();
            let target_role = want.reservation_role().map(str::to_string);
            for pass in 0..2 {
                if needed <= EPSILON {
                    break;
                }
                for share in remaining.0.iter_mut() {
                    if needed <= EPSILON {
                        break;
                    }
                    if share.name != want.name || share.value() <= EPSILON {
                        continue;
                    }
                    let share_role = share.reservation_role().map(str::to_string);
                    let eligible = match pass {
                        0 => share_role == target_role,
                        _ => share_role.is_none(),
                    };
                    if !eligible {
                        continue;
                    }
                    let take = share.value().min(needed);
                    let mut taken = share.clone();
                    taken.set_value(take);
                    found.push(taken);
                    let left = share.value() - take;
                    share.set_value(left);
                    needed -= take;
                }
            }
            if needed > EPSILON {
                return None;
            }
        }
        Some(Resources(found))
    }

    /// Remove `other`'s shares from this bag, matching by name and
    /// reservation role. Emptied shares are dropped.
    pub fn subtract(&mut self, other: &Resources) {
        for taken in &other.0 {
            let mut to_remove = taken.value();
            for share in self.0.iter_mut() {
                if to_remove <= EPSILON {
                    break;
                }
                if share.name != taken.name
                    || share.reservation_role() != taken.reservation_role()
                {
                    continue;
                }
                let cut = share.value().min(to_remove);
                share.set_value(share.value() - cut);
                to_remove -= cut;
            }
        }
        self.0.retain(|share| share.value() > EPSILON);
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|r| match r.reservation_role() {
                Some(role) => format!("{}({}):{}", r.name, role, r.value()),
                None => format!("{}:{}", r.name, r.value()),
            })
            .collect();
        write!(f, "[{}]", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved(name: &str, value: f64, role: &str) -> Resource {
        let mut r = Resource::scalar(name, value);
        r.reservations.push(Reservation::statically_for(role));
        r
    }

    #[test]
    fn test_contains_all_sums_by_name() {
        let offer = Resources::new(vec![
            Resource::scalar(CPUS, 1.5),
            Resource::scalar(CPUS, 0.5),
            Resource::scalar(MEM, 512.0),
        ]);
        assert!(offer.contains_all(&Resources::request(2.0, 512.0, 0.0)));
        assert!(!offer.contains_all(&Resources::request(2.5, 512.0, 0.0)));
        assert!(!offer.contains_all(&Resources::request(1.0, 1024.0, 0.0)));
    }

    #[test]
    fn test_find_unreserved() {
        let offer = Resources::new(vec![
            Resource::scalar(CPUS, 2.0),
            Resource::scalar(MEM, 512.0),
        ]);
        let want = Resources::request(1.0, 256.0, 0.0);
        let found = want.find(&offer).unwrap();
        assert!((found.amount(CPUS) - 1.0).abs() < 1e-9);
        assert!((found.amount(MEM) - 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_find_prefers_reserved_share() {
        let offer = Resources::new(vec![
            reserved(CPUS, 1.0, "prod"),
            reserved(MEM, 256.0, "prod"),
            Resource::scalar(CPUS, 1.0),
            Resource::scalar(MEM, 256.0),
        ]);
        let want = Resources::request(1.0, 256.0, 0.0).push_reservation("prod");
        let found = want.find(&offer).unwrap();
        assert!(found
            .0
            .iter()
            .all(|share| share.reservation_role() == Some("prod")));
    }

    #[test]
    fn test_find_reserved_falls_back_to_unreserved() {
        let offer = Resources::new(vec![
            reserved(CPUS, 0.5, "prod"),
            Resource::scalar(CPUS, 1.5),
            Resource::scalar(MEM, 256.0),
        ]);
        let want = Resources::request(1.0, 256.0, 0.0).push_reservation("prod");
        let found = want.find(&offer).unwrap();
        assert!((found.amount(CPUS) - 1.0).abs() < 1e-9);
        // The reserved half-core is used up before unreserved capacity.
        assert!((found
            .0
            .iter()
            .filter(|s| s.reservation_role() == Some("prod"))
            .map(Resource::value)
            .sum::<f64>()
            - 0.5)
            .abs()
            < 1e-9);
    }

    #[test]
    fn test_find_insufficient_returns_none() {
        let offer = Resources::new(vec![Resource::scalar(CPUS, 0.5)]);
        assert!(Resources::request(1.0, 0.0, 0.0).find(&offer).is_none());
    }

    #[test]
    fn test_subtract_drops_empty_shares() {
        let mut offer = Resources::new(vec![
            Resource::scalar(CPUS, 2.0),
            Resource::scalar(MEM, 512.0),
        ]);
        let want = Resources::request(1.0, 256.0, 0.0);
        let found = want.find(&offer).unwrap();
        offer.subtract(&found);
        assert!((offer.amount(CPUS) - 1.0).abs() < 1e-9);
        assert!((offer.amount(MEM) - 256.0).abs() < 1e-9);

        let rest = Resources::request(1.0, 256.0, 0.0);
        let found = rest.find(&offer).unwrap();
        offer.subtract(&found);
        assert!(offer.is_empty());
    }

    #[test]
    fn test_subtract_respects_roles() {
        let mut offer = Resources::new(vec![reserved(CPUS, 1.0, "prod"), Resource::scalar(CPUS, 1.0)]);
        let taken = Resources::new(vec![reserved(CPUS, 1.0, "prod")]);
        offer.subtract(&taken);
        assert_eq!(offer.0.len(), 1);
        assert_eq!(offer.0[0].reservation_role(), None);
    }

    #[test]
    fn test_unreserved_projection() {
        let offer = Resources::new(vec![reserved(CPUS, 1.0, "prod")]);
        let flat = offer.to_unreserved();
        assert_eq!(flat.0[0].reservation_role(), None);
        // Original untouched.
        assert_eq!(offer.0[0].reservation_role(), Some("prod"));
    }

    #[test]
    fn test_offer_resource_json_shape() {
        let json = r#"{
            "name": "cpus",
            "type": "SCALAR",
            "scalar": {"value": 2.0},
            "role": "*",
            "allocation_info": {"role": "prod"}
        }"#;
        let r: Resource = serde_json::from_str(json).unwrap();
        assert_eq!(r.value(), 2.0);
        assert_eq!(r.reservation_role(), None);
        assert_eq!(r.allocation_info.as_ref().unwrap().role.as_deref(), Some("prod"));
    }
}
