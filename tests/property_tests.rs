use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;

use cidralloc::{Cidr, Prefix};

fn canonical_v4(addr: u32, len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        addr & (u32::MAX << (32 - len))
    }
}

fn canonical_v6(addr: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        addr & (u128::MAX << (128 - len))
    }
}

fn arb_v4_cidr() -> impl Strategy<Value = Cidr> {
    (any::<u32>(), 0u8..=32).prop_map(|(addr, len)| {
        Cidr::new(IpAddr::V4(Ipv4Addr::from(canonical_v4(addr, len))), len)
            .expect("canonical v4 cidr")
    })
}

fn arb_v6_cidr() -> impl Strategy<Value = Cidr> {
    (any::<u128>(), 0u8..=128).prop_map(|(addr, len)| {
        Cidr::new(IpAddr::V6(Ipv6Addr::from(canonical_v6(addr, len))), len)
            .expect("canonical v6 cidr")
    })
}

proptest! {
    #[test]
    fn prop_display_parse_round_trip_v4(cidr in arb_v4_cidr()) {
        let parsed = Cidr::parse(&cidr.to_string()).expect("parse back");
        prop_assert_eq!(cidr, parsed);
    }

    #[test]
    fn prop_display_parse_round_trip_v6(cidr in arb_v6_cidr()) {
        let parsed = Cidr::parse(&cidr.to_string()).expect("parse back");
        prop_assert_eq!(cidr, parsed);
    }

    #[test]
    fn prop_children_are_ordered_contained_and_complete(
        (parent, child_len) in (any::<u32>(), 0u8..=24).prop_flat_map(|(addr, len)| {
            let parent = Cidr::new(
                IpAddr::V4(Ipv4Addr::from(canonical_v4(addr, len))),
                len,
            ).expect("parent");
            let lens = (len + 1)..=(len + 8).min(32);
            (Just(parent), lens)
        })
    ) {
        let children: Vec<Cidr> = parent.children(child_len).expect("children").collect();
        let expected = 1usize << (child_len - parent.len());
        prop_assert_eq!(children.len(), expected);

        for pair in children.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        for child in &children {
            prop_assert!(parent.contains(child));
            prop_assert_eq!(child.len(), child_len);
        }
        // Siblings never overlap.
        for pair in children.windows(2) {
            prop_assert!(!pair[0].overlaps(&pair[1]));
        }
    }

    #[test]
    fn prop_first_fit_is_lowest_free_slot(taken in proptest::collection::hash_set(0u16..256, 0..64)) {
        let parent = Cidr::parse("10.0.0.0/16").expect("parent");
        let children: Vec<Cidr> = parent.children(24).expect("children").collect();

        let mut prefix = Prefix::new_root(parent);
        for index in &taken {
            prefix = prefix.with_child_allocated(&children[*index as usize]);
        }

        let expected_index = (0u16..256)
            .find(|i| !taken.contains(i))
            .expect("free slot remains");
        let first = prefix.first_free_child(24).expect("first free");
        prop_assert_eq!(first, children[expected_index as usize]);
    }

    #[test]
    fn prop_subdivision_partitions_the_parent(cidr in arb_v4_cidr()) {
        prop_assume!(cidr.len() <= 28);
        let children: Vec<Cidr> = cidr.children(cidr.len() + 2).expect("children").collect();
        prop_assert_eq!(children.len(), 4);
        // First child starts at the parent's network address.
        prop_assert_eq!(children[0].addr(), cidr.addr());
    }
}
