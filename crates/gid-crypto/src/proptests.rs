
#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::envelope::{open, seal_file, seal_message, CipherBlob};
    use crate::hash::{derive_agent_id, is_well_formed_agent_id};
    use crate::identity::AgentKeypair;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Same key bytes always map to the same identifier
        #[test]
        fn test_agent_id_determinism(key in any::<[u8; 32]>()) {
            let a = derive_agent_id(&key);
            let b = derive_agent_id(&key);
            prop_assert_eq!(&a, &b);
            prop_assert!(is_well_formed_agent_id(&a));
        }

        #[test]
        fn test_seal_open_round_trip(
            seed in any::<[u8; 32]>(),
            message in proptest::collection::vec(any::<u8>(), 0..2048)
        ) {
            let keypair = AgentKeypair::from_secret_bytes(&seed);
            let blob = seal_message(&keypair.public_key(), &message).unwrap();

            let text = blob.to_message_text();
            let parsed = CipherBlob::parse_message_text(&text).unwrap();
            prop_assert_eq!(open(&keypair, &parsed).unwrap(), message);
        }

        #[test]
        fn test_file_round_trip(
            name in "[a-zA-Z0-9_.-]{1,40}",
            data in proptest::collection::vec(any::<u8>(), 0..4096)
        ) {
            let keypair = AgentKeypair::generate();
            let blob = seal_file(&keypair.public_key(), &name, &data).unwrap();

            let parsed = CipherBlob::parse_file_text(&blob.to_file_text().unwrap()).unwrap();
            let meta = parsed.metadata.clone().unwrap();
            prop_assert_eq!(meta.name, name);
            prop_assert_eq!(meta.size, data.len() as u64);
            prop_assert_eq!(open(&keypair, &parsed).unwrap(), data);
        }
    }
}
