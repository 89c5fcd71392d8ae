use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Длина окна по умолчанию, секунды.
pub const DEFAULT_PERIOD: u32 = 30;

/// Невалидный или нулевой период откатывается к значению по умолчанию.
pub fn effective_period(period: u32) -> u32 {
    if period == 0 { DEFAULT_PERIOD } else { period }
}

/// Одна запись токена: секрет, период окна и необязательный URL сервиса.
/// Метка записи живёт снаружи, как ключ коллекции.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub secret: String,
    pub period: u32,
    pub url: String,
}

impl TokenRecord {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            period: DEFAULT_PERIOD,
            url: String::new(),
        }
    }

    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// Коллекция целиком: метка -> запись, в стабильном порядке меток.
pub type TokenCollection = BTreeMap<String, TokenRecord>;

/// Значение на диске: либо голая строка секрета (старый формат),
/// либо объект записи с необязательными полями.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Legacy(String),
    Record {
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        period: Option<Value>,
        #[serde(default)]
        url: Option<String>,
    },
}

impl StoredValue {
    /// Нормализация к каноническому виду записи. Недостающие поля
    /// заполняются пустой строкой и периодом по умолчанию.
    pub fn normalize(self) -> TokenRecord {
        match self {
            StoredValue::Legacy(secret) => TokenRecord::new(secret),
            StoredValue::Record {
                secret,
                period,
                url,
            } => TokenRecord {
                secret: secret.unwrap_or_default(),
                period: coerce_period(period.as_ref()),
                url: url.unwrap_or_default(),
            },
        }
    }
}

/// Период из дикого JSON: число, числовая строка, всё остальное -> 30.
fn coerce_period(raw: Option<&Value>) -> u32 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed.and_then(|p| u32::try_from(p).ok()) {
        Some(p) if p > 0 => p,
        _ => DEFAULT_PERIOD,
    }
}

/// Метки, содержащие подстроку без учёта регистра. Пустая подстрока
/// пропускает всё.
pub fn filter_labels<'a>(
    tokens: &'a TokenCollection,
    needle: &str,
) -> Vec<(&'a String, &'a TokenRecord)> {
    let needle = needle.to_lowercase();
    tokens
        .iter()
        .filter(|(label, _)| label.to_lowercase().contains(&needle))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> TokenRecord {
        serde_json::from_value::<StoredValue>(value)
            .expect("stored value should parse")
            .normalize()
    }

    #[test]
    fn legacy_string_becomes_full_record() {
        let record = parse(json!("JBSWY3DPEHPK3PXP"));
        assert_eq!(record.secret, "JBSWY3DPEHPK3PXP");
        assert_eq!(record.period, DEFAULT_PERIOD);
        assert_eq!(record.url, "");
    }

    #[test]
    fn record_fields_survive_normalization() {
        let record = parse(json!({
            "secret": "JBSWY3DPEHPK3PXP",
            "period": 60,
            "url": "https://example.com"
        }));
        assert_eq!(record.secret, "JBSWY3DPEHPK3PXP");
        assert_eq!(record.period, 60);
        assert_eq!(record.url, "https://example.com");
    }

    #[test]
    fn missing_fields_get_defaults() {
        let record = parse(json!({}));
        assert_eq!(record.secret, "");
        assert_eq!(record.period, DEFAULT_PERIOD);
        assert_eq!(record.url, "");
    }

    #[test]
    fn period_parses_from_numeric_string() {
        assert_eq!(parse(json!({ "period": "45" })).period, 45);
        assert_eq!(parse(json!({ "period": " 90 " })).period, 90);
    }

    #[test]
    fn bad_periods_fall_back_to_default() {
        assert_eq!(parse(json!({ "period": 0 })).period, DEFAULT_PERIOD);
        assert_eq!(parse(json!({ "period": -15 })).period, DEFAULT_PERIOD);
        assert_eq!(parse(json!({ "period": "soon" })).period, DEFAULT_PERIOD);
        assert_eq!(parse(json!({ "period": null })).period, DEFAULT_PERIOD);
        assert_eq!(parse(json!({ "period": [30] })).period, DEFAULT_PERIOD);
    }

    #[test]
    fn records_serialize_in_canonical_form() {
        let record = TokenRecord::new("JBSWY3DPEHPK3PXP").with_period(60);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({ "secret": "JBSWY3DPEHPK3PXP", "period": 60, "url": "" })
        );
    }

    #[test]
    fn filter_is_case_insensitive() {
        let mut tokens = TokenCollection::new();
        tokens.insert("GitHub".into(), TokenRecord::new("A"));
        tokens.insert("gitlab".into(), TokenRecord::new("B"));
        tokens.insert("example.com".into(), TokenRecord::new("C"));

        let hits = filter_labels(&tokens, "GIT");
        let labels: Vec<&str> = hits.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["GitHub", "gitlab"]);

        let hits = filter_labels(&tokens, "EXA");
        let labels: Vec<&str> = hits.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["example.com"]);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let mut tokens = TokenCollection::new();
        tokens.insert("a".into(), TokenRecord::new("A"));
        tokens.insert("b".into(), TokenRecord::new("B"));
        assert_eq!(filter_labels(&tokens, "").len(), 2);
    }

    #[test]
    fn effective_period_rejects_zero_only() {
        assert_eq!(effective_period(0), DEFAULT_PERIOD);
        assert_eq!(effective_period(1), 1);
        assert_eq!(effective_period(60), 60);
    }
}
