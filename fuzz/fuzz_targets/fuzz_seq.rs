//! Fuzz target for sequence parsing and ordering.
//!
//! Parsing never fails, and ordering stays a total order for any input.

#![no_main]

use doc_replicator::Seq;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    let a: Seq = a.parse().unwrap();
    let b: Seq = b.parse().unwrap();

    assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    assert_eq!(a.cmp(&a), Ordering::Equal);
    if a.cmp(&b) == Ordering::Equal {
        assert_eq!(a, b);
    }

    // Display round-trips
    let again: Seq = a.to_string().parse().unwrap();
    assert_eq!(again, a);
});
