/// SASL mechanisms for the C2S stream: PLAIN (RFC 4616) and
/// SCRAM-SHA-1 (RFC 5802).
///
/// Pure computation only — the session layer owns the socket and drives
/// the auth/challenge/response exchange with these payloads.
use anyhow::{anyhow, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Base64 payload for `<auth mechanism='PLAIN'>`: \0username\0password.
pub fn plain_payload(username: &str, password: &str) -> String {
    let message = format!("\0{username}\0{password}");
    B64.encode(message.as_bytes())
}

/// One SCRAM-SHA-1 exchange. Construct, send [`ScramSha1::client_first`],
/// feed the server challenge to [`ScramSha1::respond`], send the result.
pub struct ScramSha1 {
    password: String,
    client_nonce: String,
    client_first_bare: String,
}

impl ScramSha1 {
    pub fn new(username: &str, password: &str) -> Self {
        Self::with_nonce(username, password, &generate_nonce())
    }

    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={username},r={nonce}"),
        }
    }

    /// Base64 client-first-message (with GS2 header, no channel binding).
    pub fn client_first(&self) -> String {
        B64.encode(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Computes the base64 client-final-message from the server's
    /// base64 challenge (server-first-message).
    pub fn respond(&self, challenge_b64: &str) -> Result<String> {
        let server_first = String::from_utf8(B64.decode(challenge_b64)?)?;
        let (combined_nonce, salt_b64, iterations) = parse_server_first(&server_first)?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(anyhow!("server nonce does not extend client nonce"));
        }

        let salt = B64.decode(&salt_b64)?;
        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        // "c=biws" is base64("n,,"), the GS2 header we sent
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare
        );
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let client_final = format!(
            "{client_final_without_proof},p={}",
            B64.encode(&client_proof)
        );
        Ok(B64.encode(client_final.as_bytes()))
    }
}

fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    B64.encode(&bytes)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Parses server-first-message: `r=nonce,s=salt,i=iterations`.
fn parse_server_first(msg: &str) -> Result<(String, String, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(val) = part.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("s=") {
            salt = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("i=") {
            iterations = Some(val.parse::<u32>()?);
        }
    }

    Ok((
        nonce.ok_or_else(|| anyhow!("missing nonce in server-first"))?,
        salt.ok_or_else(|| anyhow!("missing salt in server-first"))?,
        iterations.ok_or_else(|| anyhow!("missing iteration count in server-first"))?,
    ))
}
