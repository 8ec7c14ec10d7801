//! Property-based tests for gatekit-lib
//!
//! These tests use proptest to verify signing, codec and crypto invariants
//! across a wide range of inputs.

#[cfg(test)]
mod signing_properties {
    use gatekit_lib::params::ParameterMap;
    use gatekit_lib::signing::{sign, SignAlgorithm};
    use proptest::prelude::*;

    fn algorithm() -> impl Strategy<Value = SignAlgorithm> {
        prop_oneof![Just(SignAlgorithm::Md5), Just(SignAlgorithm::HmacSha256)]
    }

    proptest! {
        /// Insertion order never affects the signature
        #[test]
        fn order_independent(
            pairs in prop::collection::vec(("[a-z_]{1,12}", "[a-zA-Z0-9]{1,16}"), 0..12),
            secret in "[a-zA-Z0-9]{32}",
            algorithm in algorithm(),
        ) {
            let forward: ParameterMap = pairs.iter().cloned().collect();
            // Later duplicates win on collect, so dedupe before reversing.
            let reversed: ParameterMap = forward.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect();

            prop_assert_eq!(sign(&forward, &secret, algorithm), sign(&reversed, &secret, algorithm));
        }

        /// Empty values and the `sign` field are invisible to the signature
        #[test]
        fn empty_values_and_sign_ignored(
            params in prop::collection::btree_map("[a-z]{1,10}", "[a-z0-9]{1,10}", 0..8),
            empty_key in "[a-z]{1,10}",
            secret in "[a-zA-Z0-9]{1,32}",
            algorithm in algorithm(),
        ) {
            let params: ParameterMap = params;
            let mut noisy = params.clone();
            noisy.entry(empty_key).or_default();
            noisy.insert("sign".into(), "0123456789ABCDEF".into());

            prop_assert_eq!(sign(&params, &secret, algorithm), sign(&noisy, &secret, algorithm));
        }

        /// Signatures are upper-case hex of the right width
        #[test]
        fn signature_shape(
            params in prop::collection::btree_map("[a-z]{1,10}", "[a-z0-9]{1,10}", 0..8),
            algorithm in algorithm(),
        ) {
            let params: ParameterMap = params;
            let signature = sign(&params, "key", algorithm);
            let width = match algorithm {
                SignAlgorithm::Md5 => 32,
                SignAlgorithm::HmacSha256 => 64,
            };
            prop_assert_eq!(signature.len(), width);
            prop_assert!(signature.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }
}

#[cfg(test)]
mod codec_properties {
    use gatekit_lib::codec::{decode, encode};
    use gatekit_lib::params::ParameterMap;
    use proptest::prelude::*;

    proptest! {
        /// Flat maps survive encoding, including reserved markup characters
        #[test]
        fn round_trip(
            params in prop::collection::btree_map(
                "[a-zA-Z_][a-zA-Z0-9_]{0,15}",
                "[a-zA-Z0-9 <>&\"'.,:;!?/=_\\-中文]{0,32}",
                0..16,
            )
        ) {
            let params: ParameterMap = params;
            prop_assert_eq!(decode(&encode(&params)).unwrap(), params);
        }

        /// Decoding arbitrary bytes never panics
        #[test]
        fn decode_never_panics(input in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&input);
        }
    }
}

#[cfg(test)]
mod crypto_properties {
    use gatekit_lib::crypto::{decrypt, encrypt, AesKey, ENVELOPE_BLOCK};
    use proptest::prelude::*;

    proptest! {
        /// decrypt(encrypt(..)) recovers every part of the frame
        #[test]
        fn round_trip(
            key in any::<[u8; 32]>(),
            nonce in any::<[u8; 16]>(),
            message in prop::collection::vec(any::<u8>(), 0..4096),
            identity in "[a-z0-9_]{1,32}",
        ) {
            let key = AesKey::new(key);
            let ciphertext = encrypt(&nonce, &message, identity.as_bytes(), &key);
            prop_assert_eq!(ciphertext.len() % ENVELOPE_BLOCK, 0);

            let opened = decrypt(&ciphertext, &key).unwrap();
            prop_assert_eq!(opened.nonce, nonce);
            prop_assert_eq!(opened.payload, message);
            prop_assert_eq!(opened.identity, identity.into_bytes());
        }

        /// Padding adds between 1 and 32 bytes
        #[test]
        fn padding_bounds(
            message in prop::collection::vec(any::<u8>(), 0..512),
            identity in "[a-z]{1,16}",
        ) {
            let key = AesKey::new([3u8; 32]);
            let ciphertext = encrypt(&[0u8; 16], &message, identity.as_bytes(), &key);
            let framed = 20 + message.len() + identity.len();
            let pad = ciphertext.len() - framed;
            prop_assert!((1..=ENVELOPE_BLOCK).contains(&pad));
        }
    }
}
