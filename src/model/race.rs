//! Body-id derivation for race/tribe/gender asset variants.
//!
//! Skin and body-part assets are published per body id, a numeric code
//! packing race, tribe and gender. Not every combination ships its own
//! assets; missing ones resolve to the baseline body so material lookups
//! always land on something drawable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

/// The reference body every combination can fall back to.
pub const BASELINE_BODY: u16 = 101;

/// Derive the body id for a race/tribe/gender combination.
pub fn body_id(race: u16, tribe: u16, gender: Gender) -> u16 {
    let race_code = race * 2 - if gender == Gender::Male { 1 } else { 0 };
    race_code * 100 + tribe
}

/// Resolve a requested body id against the set of ids that actually have
/// assets. A miss resolves to the baseline and reports that a fallback
/// happened so callers can log it; it is not an error.
pub fn resolve_with_fallback(requested: u16, exists: impl Fn(u16) -> bool) -> (u16, bool) {
    if exists(requested) {
        (requested, false)
    } else {
        (BASELINE_BODY, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_id_packs_race_tribe_gender() {
        assert_eq!(body_id(1, 1, Gender::Male), BASELINE_BODY);
        assert_eq!(body_id(1, 1, Gender::Female), 201);
        assert_eq!(body_id(3, 1, Gender::Male), 501);
        assert_eq!(body_id(2, 2, Gender::Female), 402);
    }

    #[test]
    fn missing_combination_round_trips_to_baseline() {
        let shipped = [BASELINE_BODY, 201, 501];
        let requested = body_id(4, 1, Gender::Female);
        let (resolved, fell_back) =
            resolve_with_fallback(requested, |id| shipped.contains(&id));
        assert!(fell_back);
        assert_eq!(resolved, BASELINE_BODY);
        // Subsequent skin-material lookups must use the baseline id.
        let (again, fell_back_again) =
            resolve_with_fallback(resolved, |id| shipped.contains(&id));
        assert!(!fell_back_again);
        assert_eq!(again, BASELINE_BODY);
    }

    #[test]
    fn shipped_combination_is_untouched() {
        let (resolved, fell_back) = resolve_with_fallback(201, |id| id == 201);
        assert!(!fell_back);
        assert_eq!(resolved, 201);
    }
}
