//! User-facing chat replies for every way a request can be turned away or
//! fail. Nothing here may mention internal component or state names.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    #[default]
    En,
    Es,
}

impl std::str::FromStr for Locale {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Self::En),
            "es" | "spanish" => Ok(Self::Es),
            other => Err(ConfigError::Validation(format!(
                "unsupported locale `{other}` (expected en|es)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Notice {
    AssistantSlow,
    PriceLookupSlow,
    AnalyticsSlow,
    WebhookSlow,
    GenericSlow,
    ServiceUnavailable,
    RateLimited,
    Busy,
    Queued,
    InternalError,
}

impl Notice {
    pub fn text(self, locale: Locale) -> &'static str {
        match locale {
            Locale::En => english(self),
            Locale::Es => spanish(self),
        }
    }
}

fn english(notice: Notice) -> &'static str {
    match notice {
        Notice::AssistantSlow => {
            "I'm taking longer than usual to understand your message. Please try again in a moment."
        }
        Notice::PriceLookupSlow => {
            "Fetching prices is taking too long right now. Please try again shortly."
        }
        Notice::AnalyticsSlow => {
            "That report is taking longer than expected. Please try again in a few minutes."
        }
        Notice::WebhookSlow => "Your message is being processed. Please wait a moment.",
        Notice::GenericSlow => "The request took too long. Please try again shortly.",
        Notice::ServiceUnavailable => {
            "This feature is temporarily unavailable. Please try again in a few minutes."
        }
        Notice::RateLimited => {
            "You're sending messages a little too fast. Please wait a moment and try again."
        }
        Notice::Busy => "I'm helping a lot of people right now. Please try again shortly.",
        Notice::Queued => "I'm a bit busy right now. You're in line and I'll reply shortly.",
        Notice::InternalError => "Something went wrong on our side. Please try again.",
    }
}

fn spanish(notice: Notice) -> &'static str {
    match notice {
        Notice::AssistantSlow => {
            "Estoy tardando más de lo normal en entender tu mensaje. \
             Inténtalo de nuevo en un momento."
        }
        Notice::PriceLookupSlow => {
            "La consulta de precios está tardando demasiado. Inténtalo de nuevo en breve."
        }
        Notice::AnalyticsSlow => {
            "Ese informe está tardando más de lo esperado. Inténtalo de nuevo en unos minutos."
        }
        Notice::WebhookSlow => "Tu mensaje se está procesando. Espera un momento, por favor.",
        Notice::GenericSlow => "La solicitud tardó demasiado. Inténtalo de nuevo en breve.",
        Notice::ServiceUnavailable => {
            "Esta función no está disponible temporalmente. Inténtalo de nuevo en unos minutos."
        }
        Notice::RateLimited => {
            "Estás enviando mensajes demasiado rápido. Espera un momento e inténtalo de nuevo."
        }
        Notice::Busy => "Estoy atendiendo a muchas personas ahora. Inténtalo de nuevo en breve.",
        Notice::Queued => "Estoy un poco ocupado. Estás en la fila y te responderé en breve.",
        Notice::InternalError => "Algo salió mal de nuestro lado. Inténtalo de nuevo.",
    }
}

#[cfg(test)]
mod tests {
    use super::{Locale, Notice};

    #[test]
    fn every_notice_has_distinct_text_per_locale() {
        let notices = [
            Notice::AssistantSlow,
            Notice::PriceLookupSlow,
            Notice::AnalyticsSlow,
            Notice::WebhookSlow,
            Notice::GenericSlow,
            Notice::ServiceUnavailable,
            Notice::RateLimited,
            Notice::Busy,
            Notice::Queued,
            Notice::InternalError,
        ];

        for notice in notices {
            assert_ne!(notice.text(Locale::En), notice.text(Locale::Es), "{notice:?}");
            assert!(!notice.text(Locale::En).to_lowercase().contains("circuit"));
            assert!(!notice.text(Locale::En).to_lowercase().contains("timeout"));
        }
    }

    #[test]
    fn locale_parses_codes_and_names() {
        assert_eq!("ES".parse::<Locale>().expect("locale"), Locale::Es);
        assert_eq!("english".parse::<Locale>().expect("locale"), Locale::En);
        assert!("fr".parse::<Locale>().is_err());
    }
}
