//! Scroll a window over a slow, synthetic record source through an [AsyncPageCache].
//!
//! Each step moves the window down by half its height, reads every visible row, and waits for
//! outstanding loads to land. Pages left behind by the window are evicted once they go idle
//! for longer than `--page-timeout`.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin scroll -- --items 100000 --page-size 50 --latency 25 --log-level debug
//! ```

use clap::{value_parser, Arg, Command};
use commonware_runtime::{tokio, Clock, Metrics, Runner};
use pager::{AsyncPageCache, Config, Fetched, Source};
use std::{convert::Infallible, num::NonZeroU64, str::FromStr, thread, time::Duration};
use tracing::{info, warn, Level};

/// Rows generated on demand, each read taking `latency`.
struct Rows {
    count: u64,
    latency: Duration,
}

impl Source for Rows {
    type Item = String;
    type Error = Infallible;

    fn count(&self) -> Result<u64, Self::Error> {
        thread::sleep(self.latency);
        Ok(self.count)
    }

    fn fetch(&self, start: u64, length: u64) -> Result<Fetched<String>, Self::Error> {
        thread::sleep(self.latency);
        let end = (start + length).min(self.count);
        Ok(Fetched {
            items: (start..end).map(|index| format!("row {index}")).collect(),
            count: self.count,
        })
    }
}

fn main() {
    // Parse arguments
    let matches = Command::new("scroll")
        .about("scroll a window over a slow record source")
        .arg(
            Arg::new("items")
                .long("items")
                .default_value("10000")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("page-size")
                .long("page-size")
                .default_value("100")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("page-timeout")
                .long("page-timeout")
                .help("milliseconds a page may stay idle before eviction")
                .default_value("2000")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("latency")
                .long("latency")
                .help("milliseconds each source call takes")
                .default_value("20")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("window")
                .long("window")
                .default_value("20")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("steps")
                .long("steps")
                .default_value("50")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(String)),
        )
        .get_matches();
    let items = *matches.get_one::<u64>("items").unwrap();
    let page_size = *matches.get_one::<u64>("page-size").unwrap();
    let page_timeout = *matches.get_one::<u64>("page-timeout").unwrap();
    let latency = *matches.get_one::<u64>("latency").unwrap();
    let window = *matches.get_one::<u64>("window").unwrap();
    let steps = *matches.get_one::<u64>("steps").unwrap();
    let log_level = matches.get_one::<String>("log-level").unwrap();

    // Configure logging
    let level = Level::from_str(log_level).expect("invalid log level");
    tracing_subscriber::fmt().with_max_level(level).init();

    // Start runtime
    let executor = tokio::Runner::default();
    executor.start(|context| async move {
        let source = Rows {
            count: items,
            latency: Duration::from_millis(latency),
        };
        let cfg = Config {
            page_size: NonZeroU64::new(page_size).expect("page size must be non-zero"),
            page_timeout: Duration::from_millis(page_timeout),
        };
        let mut cache = AsyncPageCache::new(context.with_label("pager"), source, cfg);
        let mut events = cache.subscribe();

        // Wait for the first count
        cache.count();
        while cache.is_initializing() {
            if let Err(err) = cache.ready().await {
                warn!(?err, "count failed");
            }
        }

        let mut top = 0;
        for step in 0..steps {
            // Read the visible rows
            let count = cache.count();
            if count == 0 {
                break;
            }
            let bottom = (top + window).min(count);
            let mut pending = 0;
            for index in top..bottom {
                match cache.get(index) {
                    Ok(slot) if slot.is_loading() => pending += 1,
                    Ok(_) => {}
                    Err(err) => warn!(?err, index, "read failed"),
                }
            }

            // Wait for the visible rows to land
            while cache.is_loading() {
                if let Err(err) = cache.ready().await {
                    warn!(?err, "load failed");
                }
            }
            while let Ok(Some(event)) = events.try_next() {
                info!(?event, "cache event");
            }
            info!(
                step,
                top,
                pending,
                resident = ?cache.resident(),
                "scrolled"
            );

            // Move down half a window, wrapping to the top at the end
            top += (window / 2).max(1);
            if top + window > count {
                top = 0;
            }
            context.sleep(Duration::from_millis(100)).await;
        }

        println!("{}", context.encode());
    });
}
