// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Property tests checking the run-length encoded set algebra against a
//! naive `Vec<bool>` model.

use bits::Bits;
use proptest::prelude::*;

fn model_to_bits(model: &[bool]) -> Bits {
    let mut b = Bits::builder();
    for &v in model {
        b.append(1, v);
    }
    // Coalescing in `append` must leave size/popcount intact.
    assert_eq!(b.size(), model.len());
    assert_eq!(b.num_set(), model.iter().filter(|v| **v).count());
    b
}

fn bits_to_model(b: &Bits) -> Vec<bool> {
    let mut model = vec![false; b.size()];
    for i in b.all_set_view() {
        model[i] = true;
    }
    model
}

prop_compose! {
    fn two_models()(len in 1usize..200)
        (a in prop::collection::vec(any::<bool>(), len),
         b in prop::collection::vec(any::<bool>(), len))
        -> (Vec<bool>, Vec<bool>)
    {
        (a, b)
    }
}

proptest! {
    #[test]
    fn encode_round_trips(model in prop::collection::vec(any::<bool>(), 0..200)) {
        let b = model_to_bits(&model);
        prop_assert_eq!(bits_to_model(&b), model);
    }

    #[test]
    fn binary_ops_match_model((a, b) in two_models()) {
        let (ba, bb) = (model_to_bits(&a), model_to_bits(&b));

        let zip = |f: fn(bool, bool) -> bool| -> Vec<bool> {
            a.iter().zip(&b).map(|(&x, &y)| f(x, y)).collect()
        };

        prop_assert_eq!(bits_to_model(&(&ba | &bb)), zip(|x, y| x | y));
        prop_assert_eq!(bits_to_model(&(&ba & &bb)), zip(|x, y| x & y));
        prop_assert_eq!(bits_to_model(&(&ba ^ &bb)), zip(|x, y| x ^ y));
        prop_assert_eq!(bits_to_model(&(&ba - &bb)), zip(|x, y| x & !y));

        prop_assert_eq!(
            ba.has_nonempty_intersection(&bb),
            (&ba & &bb).is_any_set()
        );
        prop_assert_eq!(
            ba.has_nonempty_difference(&bb),
            (&ba - &bb).is_any_set()
        );
        prop_assert_eq!(ba.contains(&bb), !(&bb - &ba).is_any_set());
    }

    #[test]
    fn queries_match_model(model in prop::collection::vec(any::<bool>(), 1..200)) {
        let b = model_to_bits(&model);
        let set: Vec<usize> =
            model.iter().enumerate().filter(|(_, v)| **v).map(|(i, _)| i).collect();

        prop_assert_eq!(b.all_set_view().collect::<Vec<_>>(), set.clone());
        if let (Some(&first), Some(&last)) = (set.first(), set.last()) {
            prop_assert_eq!(b.first_set(), first);
            prop_assert_eq!(b.last_set(), last);
        } else {
            prop_assert_eq!(b.first_set(), model.len());
        }
        for (n, &i) in set.iter().enumerate() {
            prop_assert!(b.is_set(i));
            prop_assert_eq!(b.find_nth_set(n), i);
        }

        let c = b.complemented();
        prop_assert_eq!(c.num_set(), model.len() - set.len());
        prop_assert_eq!(c.complemented(), b);
    }
}
