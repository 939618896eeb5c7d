//! Loopback request signing (HMAC-SHA256)
//!
//! Canonical request:
//! `METHOD \n path \n name:value\n... \n signed;headers \n hex(sha256(body))`
//!
//! The signing key is derived per day, region and service from the secret
//! key, and the signature covers the canonical request's digest.

use super::Loopback;
use crate::error::ErrorCode;
use crate::logging::debug;
use crate::native::{
    ByteCursor, Credentials, HeaderView, NativePtr, SignableRequest, SignedFn, SigningApi, SigningConfig,
    SigningResultView, UserData,
};
use core::ffi::c_void;
use ring::{digest, hmac};

pub const ALGORITHM: &str = "NB-HMAC-SHA256";

const SECONDS_PER_DAY: u64 = 86_400;

fn hmac_sha256(key: &[u8], data: &[u8]) -> hmac::Tag {
    hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data))
}

/// Headers to add to `request` so it carries a valid signature
pub fn sign(request: &SignableRequest, config: &SigningConfig, credentials: &Credentials) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.sort();

    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let body_hash = sha256_hex(&request.body);

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}",
        request.method.to_ascii_uppercase(),
        request.path,
        canonical_headers,
        signed_headers,
        body_hash
    );

    let day = (config.timestamp / SECONDS_PER_DAY).to_string();
    let scope = format!("{day}/{}/{}", config.region, config.service);
    let string_to_sign = format!("{ALGORITHM}\n{}\n{scope}\n{}", config.timestamp, sha256_hex(canonical.as_bytes()));

    let secret = format!("NB{}", credentials.secret_access_key);
    let k_day = hmac_sha256(secret.as_bytes(), day.as_bytes());
    let k_region = hmac_sha256(k_day.as_ref(), config.region.as_bytes());
    let k_service = hmac_sha256(k_region.as_ref(), config.service.as_bytes());
    let signature = hex::encode(hmac_sha256(k_service.as_ref(), string_to_sign.as_bytes()));

    let mut out = vec![
        ("x-nb-date".to_string(), config.timestamp.to_string()),
        ("x-nb-content-sha256".to_string(), body_hash),
    ];
    if let Some(token) = &credentials.session_token {
        out.push(("x-nb-security-token".to_string(), token.clone()));
    }
    out.push((
        "authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    ));
    out
}

impl SigningApi for Loopback {
    fn sign_request(
        &self,
        request: &SignableRequest,
        config: &SigningConfig,
        provider: NativePtr,
        on_complete: SignedFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode> {
        if config.region.is_empty() || config.service.is_empty() {
            return Err(ErrorCode::INVALID_ARGUMENT);
        }
        let provider = self.provider(provider)?;
        let request = request.clone();
        let config = config.clone();
        let user_data = UserData(user_data);

        let scheduled = self.shared.group.schedule(move || {
            let user_data = user_data;
            let credentials = match provider.resolve() {
                Ok(credentials) => credentials,
                Err(code) => {
                    debug!(event = "loopback_sign_failed", code = code.0);
                    // Safety: completion fires exactly once with the caller's user_data
                    unsafe { on_complete(core::ptr::null(), code.0, user_data.0) };
                    return;
                }
            };
            drop(provider);

            let headers = sign(&request, &config, &credentials);
            let views: Vec<HeaderView> = headers
                .iter()
                .map(|(name, value)| HeaderView {
                    name: ByteCursor::from_slice(name.as_bytes()),
                    value: ByteCursor::from_slice(value.as_bytes()),
                })
                .collect();
            let result = SigningResultView {
                headers: views.as_ptr(),
                count: views.len(),
            };
            // Safety: `views` and `headers` outlive the call
            unsafe { on_complete(&result, ErrorCode::SUCCESS.0, user_data.0) };
        });

        if scheduled {
            Ok(())
        } else {
            Err(ErrorCode::SHUTDOWN_IN_PROGRESS)
        }
    }
}
