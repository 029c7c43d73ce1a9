// Property tests for endpoint identifiers
//
// Valid EIDs survive a print/parse cycle; malformed ones never parse.

use dtnode_core::eid::{Eid, EidError};
use proptest::prelude::*;

fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,11}"
}

fn path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9]{1,8}", 0..4).prop_map(|parts| {
        if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", parts.join("/"))
        }
    })
}

fn valid_eid() -> impl Strategy<Value = String> {
    prop_oneof![
        (label(), path()).prop_map(|(node, path)| format!("dtn://{}{}", node, path)),
        (0u64..1_000_000, 0u64..65_536).prop_map(|(node, service)| format!("ipn:{}.{}", node, service)),
        path().prop_map(|path| format!("api:me{}", path)),
        (label(), any::<u16>(), path())
            .prop_map(|(host, port, sink)| format!("cla:stcp:{}:{}{}", host, port, sink)),
        Just("dtn:none".to_string()),
    ]
}

proptest! {
    #[test]
    fn prop_round_trip_matches(raw in valid_eid()) {
        let eid = Eid::create(&raw).unwrap();
        let again = Eid::create(&eid.to_string()).unwrap();
        prop_assert!(again.matches(&eid));
        prop_assert!(eid.matches(&again));
        prop_assert_eq!(again.iana_code(), eid.iana_code());
    }

    #[test]
    fn prop_stcp_requires_numeric_port(host in label(), port in "[a-z]{1,5}") {
        let result = Eid::create(&format!("cla:stcp:{}:{}", host, port));
        let is_malformed = matches!(result, Err(EidError::Malformed { .. }));
        prop_assert!(is_malformed);
    }

    #[test]
    fn prop_ipn_requires_numbers(node in "[a-z]{1,6}", service in 0u64..100) {
        let raw = format!("ipn:{}.{}", node, service);
        prop_assert!(Eid::create(&raw).is_err());
    }

    #[test]
    fn prop_missing_scheme_rejected(raw in "[a-z0-9/.]{0,20}") {
        prop_assert!(Eid::create(&raw).is_err());
    }

    #[test]
    fn prop_unrecognized_scheme_rejected(scheme in "x[a-z]{1,6}", ssp in "[a-z0-9/]{0,12}") {
        let result = Eid::create(&format!("{}:{}", scheme, ssp));
        prop_assert_eq!(result, Err(EidError::UnknownScheme(scheme)));
    }

    #[test]
    fn prop_cla_sink_ignored_by_matches(host in label(), port in any::<u16>(), sink in path()) {
        let bare = Eid::create(&format!("cla:stcp:{}:{}", host, port)).unwrap();
        let with_sink = Eid::create(&format!("cla:stcp:{}:{}{}", host, port, sink)).unwrap();
        prop_assert!(bare.matches(&with_sink));
        prop_assert_eq!(bare.channel_key(), with_sink.channel_key());
    }
}

#[test]
fn test_unknown_scheme_rejected() {
    let err = Eid::create("mailto:someone").unwrap_err();
    assert_eq!(err, EidError::UnknownScheme("mailto".to_string()));
    println!("✓ Unrecognized schemes fail to parse");
}

#[test]
fn test_unknown_eid_keeps_text() {
    let eid = Eid::unknown("mailto", "someone");
    assert_eq!(eid.scheme(), "mailto");
    assert_eq!(eid.iana_code(), 0);
    assert_eq!(eid.to_string(), "mailto:someone");
    assert!(eid.matches(&Eid::unknown("mailto", "someone")));
    println!("✓ Explicit unknown EIDs keep their text with code 0");
}
