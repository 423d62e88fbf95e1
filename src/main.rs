use std::collections::BTreeSet;
use std::env;
use std::error::Error;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use coupon_issuance::cache::{CacheOperations, MemoryCache};
use coupon_issuance::csv::{read_coupons, read_requests, write_outcomes};
use coupon_issuance::store::{MemoryCouponStore, MemoryMemberDirectory};
use coupon_issuance::{EngineConfig, IssuanceService};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let (Some(coupons), Some(requests)) = (args.next(), args.next()) else {
        eprintln!("usage: coupon-issuance <coupons.csv> <requests.csv>");
        return ExitCode::from(2);
    };

    for path in [&coupons, &requests] {
        if !path.ends_with(".csv") {
            warn!(path, "input file seems to not be a csv file");
        }
    }

    match run(&coupons, &requests).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Issue every request of `requests_path` concurrently against an in-memory
/// deployment seeded with the coupons of `coupons_path`.
async fn run(coupons_path: &str, requests_path: &str) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::from_env();

    let mut requests = Vec::new();
    for result in read_requests(requests_path)? {
        match result {
            Ok(request) => requests.push(request),
            Err(e) => warn!("{e}"),
        }
    }
    let members: BTreeSet<_> = requests.iter().map(|request| request.member).collect();

    let service = IssuanceService::start(
        &config,
        Arc::new(MemoryCouponStore::new()),
        Arc::new(MemoryMemberDirectory::with_members(members)),
        Arc::new(MemoryCache::new()) as Arc<dyn CacheOperations>,
    );
    let engine = service.engine();

    for result in read_coupons(coupons_path)? {
        match result {
            Ok(coupon) => {
                engine.create_coupon(coupon).await?;
            }
            Err(e) => warn!("{e}"),
        }
    }

    info!(requests = requests.len(), "issuing");
    let mut tasks = JoinSet::new();
    for request in requests {
        let engine = Arc::clone(&engine);
        tasks.spawn(async move {
            let result = engine
                .issue_and_wait(request.coupon, request.member, engine.wait_timeout())
                .await;
            (request, result)
        });
    }
    let mut outcomes = tasks.join_all().await;
    outcomes.sort_by_key(|(request, _)| (request.coupon, request.member));

    service.shutdown().await;
    write_outcomes(io::stdout().lock(), outcomes)?;
    Ok(())
}
