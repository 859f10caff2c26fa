use buffet_shared::constants::session::{CREDENTIAL_ALPHABET, CREDENTIAL_LENGTH};
use rand::Rng;

use super::DisplayCredential;

/// Random display password drawn from the credential alphabet.
pub fn generate_credential() -> DisplayCredential {
    let mut rng = rand::rng();
    let secret: String = (0..CREDENTIAL_LENGTH)
        .map(|_| char::from(CREDENTIAL_ALPHABET[rng.random_range(0..CREDENTIAL_ALPHABET.len())]))
        .collect();
    DisplayCredential::new(secret)
}
