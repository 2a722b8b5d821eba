//! The pricing assistant: understands a message, looks up prices, answers.

use std::sync::Arc;

use async_trait::async_trait;
use pricebot_core::errors::ApplicationError;
use pricebot_core::gateway::{ConversationHandler, InboundMessage, RequestContext};
use pricebot_core::resilience::{
    CircuitBreakerRegistry, DependencyError, GuardedDependency, OperationType, TimeoutManager,
};
use pricebot_core::resilience::circuit_breaker::{NLP_SERVICE, PRICING_API};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const MAX_LISTED_STATIONS: usize = 3;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("upstream answered with status {0}")]
    Status(u16),
    #[error("malformed upstream payload: {0}")]
    Payload(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Payload(error.without_url().to_string())
        } else {
            Self::Request(error.without_url().to_string())
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PriceLookup,
    #[default]
    #[serde(other)]
    SmallTalk,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub fuel_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Canned answer for anything that is not a price question.
    #[serde(default)]
    pub reply: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationPrice {
    pub station: String,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[async_trait]
pub trait IntentParser: Send + Sync {
    async fn parse(&self, text: &str) -> Result<ParsedMessage, UpstreamError>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn prices(
        &self,
        fuel_type: &str,
        location: &str,
    ) -> Result<Vec<StationPrice>, UpstreamError>;
}

pub struct HttpIntentParser {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpIntentParser {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<SecretString>) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_owned(), api_key }
    }
}

#[derive(Serialize)]
struct ParseRequest<'a> {
    text: &'a str,
}

#[async_trait]
impl IntentParser for HttpIntentParser {
    async fn parse(&self, text: &str) -> Result<ParsedMessage, UpstreamError> {
        let mut request =
            self.client.post(format!("{}/v1/parse", self.base_url)).json(&ParseRequest { text });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        Ok(response.json::<ParsedMessage>().await?)
    }
}

pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_owned() }
    }
}

#[derive(Deserialize)]
struct PricesResponse {
    #[serde(default)]
    prices: Vec<StationPrice>,
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn prices(
        &self,
        fuel_type: &str,
        location: &str,
    ) -> Result<Vec<StationPrice>, UpstreamError> {
        let response = self
            .client
            .get(format!("{}/v1/prices", self.base_url))
            .query(&[("fuel_type", fuel_type), ("location", location)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status().as_u16()));
        }
        Ok(response.json::<PricesResponse>().await?.prices)
    }
}

/// Answers fuel price questions through two guarded upstreams.
pub struct PricingAssistant {
    parser: Arc<dyn IntentParser>,
    prices: Arc<dyn PriceSource>,
    nlp: GuardedDependency,
    pricing: GuardedDependency,
}

impl PricingAssistant {
    pub fn new(
        parser: Arc<dyn IntentParser>,
        prices: Arc<dyn PriceSource>,
        circuits: &CircuitBreakerRegistry,
        timeouts: &TimeoutManager,
    ) -> Self {
        let attempts = timeouts.config().default_max_attempts;
        Self {
            parser,
            prices,
            nlp: GuardedDependency::new(
                circuits.breaker(NLP_SERVICE),
                timeouts.clone(),
                OperationType::NlpService,
                attempts,
            ),
            pricing: GuardedDependency::new(
                circuits.breaker(PRICING_API),
                timeouts.clone(),
                OperationType::PriceLookup,
                attempts,
            ),
        }
    }
}

#[async_trait]
impl ConversationHandler for PricingAssistant {
    async fn handle(
        &self,
        message: &InboundMessage,
        context: &RequestContext,
    ) -> Result<String, ApplicationError> {
        let parsed = self
            .nlp
            .call(|| self.parser.parse(&message.text))
            .await
            .map_err(DependencyError::into_application)?;

        let (fuel_type, location) = match (&parsed.intent, parsed.fuel_type, parsed.location) {
            (Intent::PriceLookup, Some(fuel_type), Some(location)) => (fuel_type, location),
            (Intent::PriceLookup, _, _) => {
                return Ok("Tell me the fuel type and the town, for example \"diesel in Braga\"."
                    .to_string());
            }
            (Intent::SmallTalk, _, _) => {
                return Ok(parsed.reply.unwrap_or_else(|| {
                    "I can look up fuel prices. Try \"diesel in Braga\".".to_string()
                }));
            }
        };

        context.keep_alive().await;
        let mut stations = self
            .pricing
            .call(|| self.prices.prices(&fuel_type, &location))
            .await
            .map_err(DependencyError::into_application)?;
        stations.sort_by(|a, b| a.price.total_cmp(&b.price));

        let listed = if context.under_backpressure { 1 } else { MAX_LISTED_STATIONS };
        debug!(
            event_name = "assistant.prices.fetched",
            correlation_id = %context.correlation_id,
            stations = stations.len(),
            listed,
            "price lookup finished"
        );
        if stations.is_empty() {
            return Ok(format!("I couldn't find {fuel_type} prices near {location}."));
        }
        if context.under_backpressure {
            info!(
                event_name = "assistant.answer.reduced",
                correlation_id = %context.correlation_id,
                "backpressure; answering with cheapest station only"
            );
        }

        Ok(format_answer(&fuel_type, &location, &stations[..listed.min(stations.len())]))
    }
}

fn format_answer(fuel_type: &str, location: &str, stations: &[StationPrice]) -> String {
    let mut answer = format!("Cheapest {fuel_type} near {location}:");
    for (rank, station) in stations.iter().enumerate() {
        answer.push_str(&format!(
            "\n{}. {} {:.3} {}",
            rank + 1,
            station.station,
            station.price,
            station.currency
        ));
    }
    answer
}
