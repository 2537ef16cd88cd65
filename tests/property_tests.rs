//! Property tests for the pure data layers: record serialization, the
//! residue fingerprint, NAF-w decomposition, and the window/DAC helpers.
//! These layers have no arithmetic side effects, so they are safe to
//! hammer with random inputs.

use proptest::prelude::*;
use rug::Integer;

use primeprove::exp::choose_window;
use primeprove::file::{Reader, Writer};
use primeprove::gw::{res64, SerializedGwNum};
use primeprove::lucas::{dac_window, get_dac_s_d, naf_w, UV_MAX_SMALL};
use primeprove::state::TaskState;

proptest! {
    #[test]
    fn value_record_roundtrips(iteration in 0u32..1_000_000, limbs in proptest::collection::vec(any::<u8>(), 0..64)) {
        let state = TaskState::Value {
            iteration,
            x: Integer::from_digits(&limbs, rug::integer::Order::Lsf),
        };
        let mut w = Writer::new();
        state.write(&mut w);
        let bytes = w.into_bytes();
        let back = TaskState::read(state.type_byte(), &mut Reader::new(&bytes)).unwrap();
        prop_assert_eq!(back, state);
    }

    #[test]
    fn strong_check_record_roundtrips(
        iteration in 0u32..1_000_000,
        recovery in 0u32..1_000_000,
        a in any::<u64>(),
        b in any::<u64>(),
    ) {
        let state = TaskState::StrongCheck {
            iteration,
            recovery,
            x: SerializedGwNum::from_integer(&Integer::from(a)),
            d: SerializedGwNum::from_integer(&Integer::from(b)),
        };
        let mut w = Writer::new();
        state.write(&mut w);
        let bytes = w.into_bytes();
        let back = TaskState::read(2, &mut Reader::new(&bytes)).unwrap();
        prop_assert_eq!(back, state);
    }

    #[test]
    fn res64_is_16_hex_digits(v in any::<u64>()) {
        let s = res64(&Integer::from(v));
        prop_assert_eq!(s.len(), 16);
        prop_assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(u64::from_str_radix(&s, 16).unwrap(), v);
    }

    #[test]
    fn naf_w_reconstructs(v in 0u64..u64::MAX / 2) {
        let digits = naf_w(7, &Integer::from(v));
        let mut acc = Integer::new();
        for (j, &d) in digits.iter().enumerate() {
            acc += Integer::from(d) << (j as u32);
        }
        prop_assert_eq!(acc, Integer::from(v));
        for &d in &digits {
            if d != 0 {
                prop_assert!(d % 2 != 0);
                prop_assert!(d.unsigned_abs() <= UV_MAX_SMALL as u32);
            }
        }
    }

    #[test]
    fn window_width_is_bounded(len in 1u32..1_000_000) {
        let w = choose_window(len, Some(8), None);
        prop_assert!((1..=8).contains(&w));
    }

    #[test]
    fn dac_parameter_is_coprime(p in prop::sample::select(vec![17u64, 19, 101, 997, 7919, 104729])) {
        let (lo, hi) = dac_window(p);
        let (d, len) = get_dac_s_d(p, lo, hi);
        prop_assert!(d >= 1 && d < p);
        prop_assert_eq!(gcd(p, d), 1);
        prop_assert!(len >= 1);
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
