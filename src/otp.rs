use crate::entry::{TokenRecord, effective_period};
use crate::error::StoreError;
use crate::scheduler::now_unix;
use totp_rs::{Algorithm, Secret, TOTP};
use url::Url;

/// Код для секрета с заданным периодом на текущий момент.
pub fn generate(secret: &str, period: u32) -> Result<String, StoreError> {
    generate_at(secret, period, now_unix())
}

/// Чистая версия генератора: код как функция (секрет, период, время).
/// Никакого разделяемого состояния между вызовами нет, поэтому записи
/// с разными периодами не мешают друг другу.
pub fn generate_at(secret: &str, period: u32, unix_seconds: u64) -> Result<String, StoreError> {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return Err(StoreError::malformed_secret("secret is empty"));
    }

    let secret_bytes = Secret::Encoded(trimmed.to_string())
        .to_bytes()
        .map_err(|e| StoreError::MalformedSecret(format!("bad base32: {e:?}")))?;
    if secret_bytes.is_empty() {
        return Err(StoreError::malformed_secret("secret decodes to nothing"));
    }

    // *_unchecked, чтобы не спотыкаться о короткие (80-битные) секреты,
    // какие выдаёт, например, GitHub.
    let totp = TOTP::new_unchecked(
        Algorithm::SHA1,
        6,
        1,
        u64::from(effective_period(period)),
        secret_bytes,
    );
    Ok(totp.generate(unix_seconds))
}

/// Код для отображения: пустой секрет и ошибки генерации дают `None`,
/// чтобы вид показал заглушку вместо падения.
pub fn display_code(record: &TokenRecord) -> Option<String> {
    if record.secret.trim().is_empty() {
        return None;
    }
    match generate(&record.secret, record.period) {
        Ok(code) => Some(code),
        Err(e) => {
            tracing::warn!("code generation failed: {e}");
            None
        }
    }
}

/// Разбор ввода команды add: либо otpauth:// URI, либо голый base32-секрет.
/// Возвращает секрет и период, если URI его задаёт.
///
/// Поддерживается только totp с шестью цифрами и SHA1; всё прочее
/// отклоняется сразу, чтобы не сохранить секрет, коды к которому
/// никогда не совпадут с сервером.
pub fn parse_secret_input(input: &str) -> Result<(String, Option<u32>), StoreError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(StoreError::validation("secret must not be empty"));
    }

    if !input.starts_with("otpauth://") {
        check_base32(input)?;
        return Ok((input.to_string(), None));
    }

    let uri = Url::parse(input)
        .map_err(|e| StoreError::MalformedSecret(format!("invalid otpauth URI: {e}")))?;
    let kind = uri.host_str().unwrap_or("").to_lowercase();
    if kind != "totp" {
        return Err(StoreError::MalformedSecret(format!(
            "unsupported otpauth type '{kind}', only 'totp' is supported"
        )));
    }

    let mut secret: Option<String> = None;
    let mut period: Option<u32> = None;
    for (key, value) in uri.query_pairs() {
        match key.as_ref() {
            "secret" => secret = Some(value.to_string()),
            "period" => period = value.parse::<u32>().ok(),
            "digits" => {
                if value.as_ref() != "6" {
                    return Err(StoreError::MalformedSecret(format!(
                        "unsupported digits '{value}', only 6-digit codes are supported"
                    )));
                }
            }
            "algorithm" => {
                if !value.eq_ignore_ascii_case("SHA1") {
                    return Err(StoreError::MalformedSecret(format!(
                        "unsupported algorithm '{value}', only SHA1 is supported"
                    )));
                }
            }
            _ => {}
        }
    }

    let secret =
        secret.ok_or_else(|| StoreError::malformed_secret("otpauth URI has no 'secret' param"))?;
    check_base32(&secret)?;
    Ok((secret, period))
}

fn check_base32(secret: &str) -> Result<(), StoreError> {
    Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|e| StoreError::MalformedSecret(format!("bad base32: {e:?}")))?;
    Ok(())
}
