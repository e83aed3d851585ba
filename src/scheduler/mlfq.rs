//! Fixed-point 17.14 arithmetic and the MLFQ formulas. Pure functions, no
//! scheduler state — fully host-testable.

pub const PRI_MIN: i32 = 0;
pub const PRI_MAX: i32 = 63;
pub const PRI_DEFAULT: i32 = 31;
pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 20;

const FRACTION_BITS: i32 = 14;
const FIXED_ONE: i64 = 1 << FRACTION_BITS;

/// A 17.14 fixed-point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed(i64);

impl Fixed {
    pub fn from_int(n: i64) -> Self {
        Fixed(n * FIXED_ONE)
    }

    pub fn zero() -> Self {
        Fixed(0)
    }

    pub fn to_int_round(self) -> i64 {
        if self.0 >= 0 {
            (self.0 + FIXED_ONE / 2) / FIXED_ONE
        } else {
            (self.0 - FIXED_ONE / 2) / FIXED_ONE
        }
    }

    pub fn to_int_trunc(self) -> i64 {
        self.0 / FIXED_ONE
    }

    pub fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub fn add_int(self, n: i64) -> Fixed {
        Fixed(self.0 + n * FIXED_ONE)
    }

    pub fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub fn mul(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * other.0 as i128) / FIXED_ONE as i128) as i64)
    }

    pub fn mul_int(self, n: i64) -> Fixed {
        Fixed(self.0 * n)
    }

    pub fn div(self, other: Fixed) -> Fixed {
        Fixed(((self.0 as i128 * FIXED_ONE as i128) / other.0 as i128) as i64)
    }

    pub fn div_int(self, n: i64) -> Fixed {
        Fixed(self.0 / n)
    }
}

/// `load_avg = (59/60)*load_avg + (1/60)*ready_count`
pub fn update_load_avg(load_avg: Fixed, ready_count: usize) -> Fixed {
    let fifty_nine_sixtieths = Fixed::from_int(59).div(Fixed::from_int(60));
    let one_sixtieth = Fixed::from_int(1).div(Fixed::from_int(60));
    fifty_nine_sixtieths.mul(load_avg).add(one_sixtieth.mul_int(ready_count as i64))
}

/// `recent_cpu = (2*load_avg)/(2*load_avg+1) * recent_cpu + nice`
pub fn update_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let two_load = load_avg.mul_int(2);
    let coeff = two_load.div(two_load.add_int(1));
    coeff.mul(recent_cpu).add_int(nice as i64)
}

/// `priority = PRI_MAX - recent_cpu/4 - nice*2`, clamped to [PRI_MIN, PRI_MAX].
pub fn compute_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let p = Fixed::from_int(PRI_MAX as i64)
        .sub(recent_cpu.div_int(4))
        .sub(Fixed::from_int((nice * 2) as i64));
    clamp_priority(p.to_int_trunc() as i32)
}

pub fn clamp_priority(p: i32) -> i32 {
    p.clamp(PRI_MIN, PRI_MAX)
}

pub fn clamp_nice(n: i32) -> i32 {
    n.clamp(NICE_MIN, NICE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_int_roundtrip() {
        let f = Fixed::from_int(5);
        assert_eq!(f.to_int_trunc(), 5);
        assert_eq!(f.to_int_round(), 5);
    }

    #[test]
    fn fixed_point_rounding_matches_reference_behavior() {
        // 59/60 of a fixed-point int should round to nearest, ties away
        // from zero per the classic x -> (x + f/2) / f formula.
        let f = Fixed::from_int(1).div(Fixed::from_int(2)); // 0.5
        assert_eq!(f.to_int_round(), 1);
        let neg = Fixed::from_int(-1).div(Fixed::from_int(2));
        assert_eq!(neg.to_int_round(), -1);
    }

    #[test]
    fn load_avg_starts_at_zero_and_moves_toward_ready_count() {
        let mut load_avg = Fixed::zero();
        for _ in 0..100 {
            load_avg = update_load_avg(load_avg, 1);
        }
        // Converges toward 1.0 as ready_count stays pinned at 1.
        assert!(load_avg.to_int_round() == 1);
    }

    #[test]
    fn recent_cpu_with_zero_load_avg_decays_to_nice() {
        let mut recent_cpu = Fixed::from_int(100);
        let load_avg = Fixed::zero();
        for _ in 0..5 {
            recent_cpu = update_recent_cpu(recent_cpu, load_avg, 0);
        }
        // coeff is 0/(0+1) = 0, so recent_cpu collapses to nice (0) immediately.
        assert_eq!(recent_cpu.to_int_trunc(), 0);
    }

    #[test]
    fn priority_decreases_as_recent_cpu_increases() {
        let low = compute_priority(Fixed::zero(), 0);
        let high = compute_priority(Fixed::from_int(40), 0);
        assert!(high < low);
        assert_eq!(low, PRI_MAX);
    }

    #[test]
    fn priority_is_clamped_to_valid_range() {
        let p = compute_priority(Fixed::from_int(1000), NICE_MAX);
        assert_eq!(p, PRI_MIN);
    }

    #[test]
    fn nice_penalty_reduces_priority_by_double() {
        let base = compute_priority(Fixed::zero(), 0);
        let niced = compute_priority(Fixed::zero(), 5);
        assert_eq!(base - niced, 10);
    }

    #[test]
    fn default_priority_constant_matches_reference() {
        assert_eq!(PRI_DEFAULT, 31);
        assert_eq!(PRI_MAX, 63);
        assert_eq!(PRI_MIN, 0);
    }

    #[test]
    fn clamp_helpers_bound_their_inputs() {
        assert_eq!(clamp_priority(100), PRI_MAX);
        assert_eq!(clamp_priority(-5), PRI_MIN);
        assert_eq!(clamp_nice(50), NICE_MAX);
        assert_eq!(clamp_nice(-50), NICE_MIN);
    }
}
