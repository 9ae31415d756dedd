//! Password authentication: cleartext, MD5 and SCRAM-SHA-256.
//!
//! SCRAM follows RFC 5802 / RFC 7677 without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer_input))
}

/// SCRAM failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server message is missing the {0} attribute")]
    MissingAttribute(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    SignatureMismatch,
    #[error("server-final message received before server-first")]
    OutOfOrder,
}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Set once the server-first message has been processed
    verifier: Option<ServerVerifier>,
}

struct ServerVerifier {
    salted_password: [u8; 32],
    auth_message: String,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            verifier: None,
        }
    }

    fn client_first_bare(&self) -> String {
        // PostgreSQL ignores the SCRAM username and uses the startup user
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the client-final message.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(v.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?);
            }
        }

        let nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration"))?;
        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }
        if !nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = salted_password(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.verifier = Some(ServerVerifier {
            salted_password,
            auth_message,
        });

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server-signature>`.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let verifier = self.verifier.as_ref().ok_or(ScramError::OutOfOrder)?;
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let encoded = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerSignature)?;
        let signature = BASE64
            .decode(encoded.trim_end_matches('\0'))
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(&verifier.salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, verifier.auth_message.as_bytes());
        if signature != expected {
            return Err(ScramError::SignatureMismatch);
        }
        Ok(())
    }
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("HMAC accepts keys of any length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}
