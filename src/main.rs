use std::{
    convert::Infallible,
    io::{self, Write},
    process,
    sync::Arc,
    time::Duration,
};

use concierge::{
    application::{
        Accelerator,
        error::AppError,
        pagination::{PageResult, RawPageParams, ResourceDescriptor, SortOrder},
    },
    cache::KeyBuilder,
    config::{self, CheckArgs},
    infra::{error::InfraError, telemetry},
};
use serde_json::{Value, json};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const PROBE_TTL: Duration = Duration::from_secs(30);
const PROBE_ROOMS: u32 = 25;
const PROBE_PAGE_LIMIT: i64 = 10;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let messages = error.messages();
    if dispatcher::has_been_set() {
        error!(error = %error, chain = ?messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, chain = ?messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or_default();

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Check(args) => run_check(settings, args).await,
    }
}

async fn run_check(settings: config::Settings, args: CheckArgs) -> Result<(), AppError> {
    let accelerator = Accelerator::init(&settings).await;

    let probed = probe(&accelerator, &args).await;
    let stats = accelerator.stats().await;
    accelerator.shutdown().await;
    probed?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &stats).map_err(InfraError::from)?;
    writeln!(stdout).map_err(InfraError::from)?;
    Ok(())
}

async fn probe(accelerator: &Accelerator, args: &CheckArgs) -> Result<(), AppError> {
    let cache = accelerator.cache();
    let key = KeyBuilder::new("probe")
        .segment(process::id().to_string())
        .build();
    let expected = json!({ "ok": true, "pid": process::id() });

    cache
        .set_json(&key, &expected, Some(PROBE_TTL))
        .await
        .map_err(|err| AppError::probe(err.to_string()))?;
    let read: Option<Value> = cache.get_json(&key).await;
    if read.as_ref() != Some(&expected) {
        return Err(AppError::probe(format!(
            "round trip for `{key}` returned {read:?}"
        )));
    }
    cache.delete(&key).await;
    if cache.get(&key).await.is_some() {
        return Err(AppError::probe(format!("`{key}` survived deletion")));
    }

    let resource = ResourceDescriptor::new("probe-rooms", "number")
        .default_order(SortOrder::Asc)
        .searchable(["name"])
        .sortable(["number", "name"]);
    let rooms: Arc<Vec<Value>> = Arc::new(
        (1..=PROBE_ROOMS)
            .map(|number| json!({ "number": number, "name": format!("Room {number}") }))
            .collect(),
    );
    let params = RawPageParams::default().limit(PROBE_PAGE_LIMIT);

    for _ in 0..args.probe_requests {
        let rooms = Arc::clone(&rooms);
        let page: PageResult<Value> = accelerator
            .pagination()
            .paginate(&resource, &params, move |request| async move {
                Ok::<_, Infallible>(request.apply(&rooms))
            })
            .await?;
        if page.total != u64::from(PROBE_ROOMS) {
            return Err(AppError::probe(format!(
                "pagination reported {} rooms, expected {PROBE_ROOMS}",
                page.total
            )));
        }
    }
    let cleared = accelerator.pagination().invalidate_resource(&resource).await;

    info!(
        key = %key,
        probe_requests = args.probe_requests,
        cleared,
        "Cache probe succeeded"
    );
    Ok(())
}
