//! Signed REST client for the crypto venue's order endpoints.

use chrono::Utc;
use serde::Serialize;

use tradecore::types::{Price, Qty, Side};

use super::{BinanceError, PRICE_SCALE, QTY_SCALE};
use crate::utils::sign_hmac_sha256;

#[derive(Clone)]
pub struct BinanceClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderParams<'a> {
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<&'a str>,
    new_client_order_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryOrderParams<'a> {
    symbol: &'a str,
    orig_client_order_id: &'a str,
}

impl BinanceClient {
    pub fn new(url: &str, api_key: &str, secret: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            api_key: api_key.to_string(),
            secret: secret.to_string(),
        }
    }

    fn signed_query<P: Serialize>(&self, params: &P) -> Result<String, BinanceError> {
        let mut query = serde_qs::to_string(params)?;
        let timestamp = Utc::now().timestamp_millis();
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("recvWindow=5000&timestamp={timestamp}"));
        let signature = sign_hmac_sha256(&self.secret, &query);
        query.push_str(&format!("&signature={signature}"));
        Ok(query)
    }

    async fn decode<T: for<'a> serde::Deserialize<'a>>(
        resp: reqwest::Response,
    ) -> Result<T, BinanceError> {
        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            let error: super::msg::ApiError = resp.json().await?;
            Err(BinanceError::Api {
                code: error.code,
                msg: error.msg,
            })
        }
    }

    pub async fn new_order(
        &self,
        symbol: &str,
        client_order_id: &str,
        side: Side,
        price: Price,
        qty: Qty,
    ) -> Result<super::msg::OrderResponse, BinanceError> {
        let market = price == 0;
        let params = NewOrderParams {
            symbol,
            side: match side {
                Side::Buy => "BUY",
                Side::Sell => "SELL",
            },
            order_type: if market { "MARKET" } else { "LIMIT" },
            quantity: qty as f64 / QTY_SCALE,
            price: (!market).then_some(price as f64 / PRICE_SCALE),
            time_in_force: (!market).then_some("GTC"),
            new_client_order_id: client_order_id,
        };
        let query = self.signed_query(&params)?;
        let resp = self
            .client
            .post(format!("{}/api/v3/order?{}", self.url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<super::msg::OrderResponse, BinanceError> {
        let params = QueryOrderParams {
            symbol,
            orig_client_order_id: client_order_id,
        };
        let query = self.signed_query(&params)?;
        let resp = self
            .client
            .delete(format!("{}/api/v3/order?{}", self.url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<super::msg::OrderResponse, BinanceError> {
        let params = QueryOrderParams {
            symbol,
            orig_client_order_id: client_order_id,
        };
        let query = self.signed_query(&params)?;
        let resp = self
            .client
            .get(format!("{}/api/v3/order?{}", self.url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::decode(resp).await
    }
}
