//! Location pool
//!
//! Fixed set of Greater Toronto Area cities used to diversify each session's
//! simulated geolocation. One is assigned uniformly at random per account.

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub name: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

pub const LOCATION_POOL: &[Location] = &[
    Location { name: "Toronto", latitude: 43.6532, longitude: -79.3832 },
    Location { name: "Mississauga", latitude: 43.5890, longitude: -79.6441 },
    Location { name: "Brampton", latitude: 43.7315, longitude: -79.7624 },
    Location { name: "Markham", latitude: 43.8561, longitude: -79.3370 },
    Location { name: "Vaughan", latitude: 43.8361, longitude: -79.4983 },
    Location { name: "Richmond Hill", latitude: 43.8828, longitude: -79.4403 },
    Location { name: "Oakville", latitude: 43.4675, longitude: -79.6877 },
    Location { name: "Burlington", latitude: 43.3255, longitude: -79.7990 },
    Location { name: "Pickering", latitude: 43.8384, longitude: -79.0868 },
    Location { name: "Ajax", latitude: 43.8509, longitude: -79.0204 },
];

/// Pick a location for the next session.
pub fn assign() -> &'static Location {
    let idx = rand::thread_rng().gen_range(0..LOCATION_POOL.len());
    &LOCATION_POOL[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_draws_from_the_pool() {
        for _ in 0..50 {
            let loc = assign();
            assert!(LOCATION_POOL.iter().any(|l| l == loc));
        }
    }
}
