//! Order-entry REST client for the equity venue.

use serde::Deserialize;

use tradecore::types::{Price, Qty, Side};

use super::ZerodhaError;

/// Paise to the venue's quoted rupee unit.
fn to_rupees(price: Price) -> f64 {
    price as f64 / 100.0
}

#[derive(Clone)]
pub struct KiteClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OrderIdData {
    order_id: String,
}

/// One row of an order's state history.
#[derive(Clone, Debug, Deserialize)]
pub struct OrderState {
    pub status: String,
    #[serde(default)]
    pub filled_quantity: Qty,
    #[serde(default)]
    pub pending_quantity: Qty,
    #[serde(default)]
    pub average_price: f64,
}

impl KiteClient {
    pub fn new(url: &str, api_key: &str, access_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, ZerodhaError> {
        if envelope.status == "success" {
            envelope.data.ok_or_else(|| ZerodhaError::Api {
                status: envelope.status,
                message: "missing data".to_string(),
            })
        } else {
            Err(ZerodhaError::Api {
                status: envelope.status,
                message: envelope.message.unwrap_or_default(),
            })
        }
    }

    /// Places a regular order; `price == 0` submits a market order.
    pub async fn place_order(
        &self,
        symbol: &str,
        exchange: &str,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> Result<String, ZerodhaError> {
        let transaction_type = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let mut form = vec![
            ("tradingsymbol", symbol.to_string()),
            ("exchange", exchange.to_string()),
            ("transaction_type", transaction_type.to_string()),
            ("quantity", qty.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
        ];
        if price > 0 {
            form.push(("order_type", "LIMIT".to_string()));
            form.push(("price", format!("{:.2}", to_rupees(price))));
        } else {
            form.push(("order_type", "MARKET".to_string()));
        }

        let envelope: Envelope<OrderIdData> = self
            .client
            .post(format!("{}/orders/regular", self.url))
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .form(&form)
            .send()
            .await?
            .json()
            .await?;
        Self::unwrap_envelope(envelope).map(|data| data.order_id)
    }

    pub async fn cancel_order(&self, venue_order_id: &str) -> Result<String, ZerodhaError> {
        let envelope: Envelope<OrderIdData> = self
            .client
            .delete(format!("{}/orders/regular/{}", self.url, venue_order_id))
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .json()
            .await?;
        Self::unwrap_envelope(envelope).map(|data| data.order_id)
    }

    /// Fetches the order's state history; the last row is current.
    pub async fn order_status(&self, venue_order_id: &str) -> Result<OrderState, ZerodhaError> {
        let envelope: Envelope<Vec<OrderState>> = self
            .client
            .get(format!("{}/orders/{}", self.url, venue_order_id))
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .json()
            .await?;
        Self::unwrap_envelope(envelope)?
            .pop()
            .ok_or_else(|| ZerodhaError::Api {
                status: "success".to_string(),
                message: "empty order history".to_string(),
            })
    }
}
