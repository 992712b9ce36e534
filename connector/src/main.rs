//! Entry point: loads configuration, wires the venue adapter, the order
//! gateway and the trade engine together over SPSC rings, and supervises
//! shutdown. Exit code 0 on a clean stop, 1 on configuration or connection
//! failure.

mod binance;
mod cache;
mod connector;
mod gateway;
mod session;
mod synth;
mod utils;
mod zerodha;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradecore::{
    algo::{AlgoParams, AlgoType},
    config::{Config, ExchangeType, TradingMode},
    engine::TradeEngine,
    oms::OrderManager,
    queue::Spsc,
    risk::{RiskManager, TickerRiskLimits},
    types::StreamMode,
};

use crate::{
    binance::{rest::BinanceClient, BinanceAdapter},
    cache::InstrumentStore,
    connector::{Connector, Instrument},
    gateway::{
        live::{LiveEngine, LiveOrderClient, LiveSymbol},
        paper::PaperEngine,
        ExecutionBackend, OrderGateway,
    },
    session::STOP_DEADLINE,
    zerodha::{rest::KiteClient, ZerodhaAdapter},
};

const ZERODHA_WS_URL: &str = "wss://ws.kite.trade/";
const ZERODHA_API_URL: &str = "https://api.kite.trade";
const BINANCE_STREAM_URL: &str = "wss://stream.binance.com:9443/stream";
const BINANCE_API_URL: &str = "https://api.binance.com";

const MARKET_RING_CAPACITY: usize = 65_536;
const REQUEST_RING_CAPACITY: usize = 4_096;
const RESPONSE_RING_CAPACITY: usize = 4_096;

/// The process shuts down after this long without a single event.
const SILENT_SHUTDOWN: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "trader",
    about = "Bridges a venue feed to the strategy engine and routes its orders"
)]
struct Args {
    client_id: u64,
    /// MARKET_MAKER or LIQUIDITY_TAKER.
    algo_type: String,
    /// ZERODHA or BINANCE.
    exchange_type: String,
    api_key: String,
    api_secret: String,
    /// Per-instrument risk overrides, five numbers per instrument:
    /// clip threshold max_order max_position max_loss.
    #[arg(num_args = 0.., value_name = "RISK_PARAM")]
    instrument_params: Vec<f64>,
    #[arg(long, default_value = "config.json")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        error!(?error, "startup failed");
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<(), anyhow::Error> {
    let exchange: ExchangeType = args.exchange_type.parse()?;
    config.trading_system.active_exchange = exchange;

    let entry = config
        .exchanges
        .entry(exchange.as_str().to_string())
        .or_default();
    if !args.api_key.is_empty() {
        entry.api_credentials.api_key = args.api_key.clone();
    }
    if !args.api_secret.is_empty() {
        entry.api_credentials.api_secret = args.api_secret.clone();
    }

    if args.instrument_params.len() % 5 != 0 {
        return Err(anyhow!(
            "instrument risk parameters come in groups of five: \
             clip threshold max_order max_position max_loss"
        ));
    }
    for (instrument, chunk) in config
        .instruments
        .iter_mut()
        .zip(args.instrument_params.chunks(5))
    {
        instrument.clip = chunk[0] as i64;
        instrument.threshold = chunk[1];
        instrument.max_order_size = chunk[2] as i64;
        instrument.max_position = chunk[3] as i64;
        instrument.max_loss = chunk[4];
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;
    apply_overrides(&mut config, &args)?;
    config.validate()?;

    let exchange = config.trading_system.active_exchange;
    let mode = config.trading_system.trading_mode;
    info!(?exchange, ?mode, instruments = config.instruments.len(), "starting");

    if config.instruments.is_empty() {
        return Err(anyhow!("no instruments configured"));
    }

    let (market_tx, market_rx) = Spsc::with_capacity(MARKET_RING_CAPACITY);
    let (request_tx, request_rx) = Spsc::with_capacity(REQUEST_RING_CAPACITY);
    let (response_tx, response_rx) = Spsc::with_capacity(RESPONSE_RING_CAPACITY);

    let mut risk = RiskManager::new(
        config.risk.max_position_value,
        config.risk.max_daily_loss,
    );
    for instrument in &config.instruments {
        risk.set_limits(
            instrument.ticker_id,
            TickerRiskLimits {
                max_order_size: instrument.max_order_size,
                max_position: instrument.max_position,
                max_loss: instrument.max_loss,
            },
        );
    }

    let algo_type: AlgoType = args.algo_type.parse().map_err(anyhow::Error::msg)?;
    let parameters = &config.trading_system.strategy.parameters;
    let first = &config.instruments[0];
    let algo = tradecore::algo::build(
        algo_type,
        AlgoParams {
            clip: parameters
                .get("clip")
                .map(|v| *v as i64)
                .unwrap_or(first.clip),
            threshold: parameters
                .get("threshold")
                .copied()
                .unwrap_or(first.threshold),
        },
    );

    let om = OrderManager::new(args.client_id, request_tx);
    let mut engine = TradeEngine::new(
        algo,
        om,
        risk,
        market_rx,
        response_rx,
        SILENT_SHUTDOWN,
    );

    let running = Arc::new(AtomicBool::new(true));

    let venue = config
        .active_exchange_config()
        .cloned()
        .unwrap_or_default();
    let credentials = &venue.api_credentials;

    let mut adapter: Box<dyn Connector> = match exchange {
        ExchangeType::Zerodha => {
            let access_token = credentials
                .access_token
                .clone()
                .ok_or_else(|| anyhow!("zerodha requires api_credentials.access_token"))?;
            let store = InstrumentStore::new(
                venue.cache_config.instruments_dir.clone(),
                venue.cache_config.ttl_hours,
            );
            let cached = store
                .load(exchange.as_str())?
                .ok_or_else(|| anyhow!("instrument cache missing or expired; refresh it"))?;
            Box::new(
                ZerodhaAdapter::builder()
                    .ws_url(ZERODHA_WS_URL)
                    .api_key(&credentials.api_key)
                    .access_token(&access_token)
                    .tokens(cache::token_map(&cached))
                    .market_tx(market_tx)
                    .build()?,
            )
        }
        ExchangeType::Binance => Box::new(
            BinanceAdapter::builder()
                .stream_url(BINANCE_STREAM_URL)
                .market_tx(market_tx)
                .build()?,
        ),
    };

    for instrument in &config.instruments {
        adapter.subscribe(
            &Instrument {
                symbol: instrument.symbol.clone(),
                exchange: instrument.exchange.clone(),
                ticker_id: instrument.ticker_id,
            },
            StreamMode::Full,
        )?;
    }
    adapter.start()?;

    let backend = match mode {
        TradingMode::Paper => {
            ExecutionBackend::Paper(PaperEngine::new(config.trading_system.paper_trading))
        }
        TradingMode::Live => {
            let client = match exchange {
                ExchangeType::Zerodha => LiveOrderClient::Kite(KiteClient::new(
                    ZERODHA_API_URL,
                    &credentials.api_key,
                    credentials.access_token.as_deref().unwrap_or_default(),
                )),
                ExchangeType::Binance => LiveOrderClient::Binance(BinanceClient::new(
                    BINANCE_API_URL,
                    &credentials.api_key,
                    &credentials.api_secret,
                )),
            };
            let symbols = config
                .instruments
                .iter()
                .map(|instrument| {
                    (
                        instrument.ticker_id,
                        LiveSymbol {
                            symbol: instrument.symbol.clone(),
                            exchange: instrument.exchange.clone(),
                        },
                    )
                })
                .collect();
            ExecutionBackend::Live(LiveEngine::new(client, symbols))
        }
    };
    let mut order_gateway = OrderGateway::new(request_rx, response_tx, backend);
    for instrument in &config.instruments {
        order_gateway.register_ticker(instrument.ticker_id);
    }
    tokio::spawn(order_gateway.run(running.clone()));

    let engine_running = running.clone();
    let engine_handle = thread::Builder::new()
        .name("trade-engine".to_string())
        .spawn(move || engine.run(engine_running))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                running.store(false, Ordering::Release);
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                // The engine clears the flag itself after the silent
                // threshold.
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }

    running.store(false, Ordering::Release);
    adapter.stop();
    tokio::time::sleep(STOP_DEADLINE).await;
    let _ = engine_handle.join();
    info!("shut down");
    Ok(())
}
