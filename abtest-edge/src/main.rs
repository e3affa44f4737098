use std::{env, net::SocketAddr, process::ExitCode, time::Duration};

use abtest_edge::EdgeBuilder;
use getopts::{Matches, Options};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {program} --upstream URL [options]");
    print!("{}", opts.usage(&brief));
}

fn opts() -> Options {
    let mut opts = Options::new();

    opts.optopt("l", "listen", "address to listen on (default 0.0.0.0:8787)", "ADDR");
    opts.optopt("u", "upstream", "origin to forward pages to, e.g. http://127.0.0.1:8080", "URL");
    opts.optopt("s", "storage", "directory to persist counters in (default: in memory)", "DIR");
    opts.optopt("t", "write-timeout", "counter read/write bound (default 5000)", "MILLIS");
    opts.optopt("c", "cookie-max-age", "cookie lifetime (default 1 year)", "SECONDS");
    opts.optopt("r", "redirect", "where the action endpoint redirects to (default /)", "LOCATION");
    opts.optmulti("a", "allow", "address or subnet allowed to read results (repeatable)", "NET");
    opts.optflag("h", "help", "print this help menu");

    opts
}

fn configure(matches: &Matches) -> Result<EdgeBuilder, String> {
    let upstream = matches.opt_str("upstream").ok_or("missing required option --upstream")?;
    let mut builder = EdgeBuilder::new().with_upstream(&upstream).map_err(|e| e.to_string())?;

    if let Some(listen) = matches.opt_str("listen") {
        let address = listen
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid listen address {listen:?}: {e}"))?;
        builder = builder.with_http_listener(address);
    }

    if let Some(storage) = matches.opt_str("storage") {
        builder = builder.with_storage_path(storage);
    }

    if let Some(timeout) = matches.opt_str("write-timeout") {
        let millis =
            timeout.parse::<u64>().map_err(|e| format!("invalid write timeout {timeout:?}: {e}"))?;
        builder = builder.with_write_timeout(Duration::from_millis(millis));
    }

    if let Some(max_age) = matches.opt_str("cookie-max-age") {
        let secs = max_age
            .parse::<u64>()
            .map_err(|e| format!("invalid cookie max age {max_age:?}: {e}"))?;
        builder = builder.with_cookie_max_age(Duration::from_secs(secs));
    }

    if let Some(redirect) = matches.opt_str("redirect") {
        builder = builder.with_action_redirect(redirect).map_err(|e| e.to_string())?;
    }

    for address in matches.opt_strs("allow") {
        builder = builder.add_allowed_address(address).map_err(|e| e.to_string())?;
    }

    Ok(builder)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("abtest-edge", String::as_str);
    let opts = opts();

    let matches = match opts.parse(args.get(1..).unwrap_or_default()) {
        Ok(m) => m,
        Err(f) => {
            error!("Failed to parse command line args: {}", f);
            return ExitCode::FAILURE;
        }
    };

    if matches.opt_present("help") {
        print_usage(program, &opts);
        return ExitCode::SUCCESS;
    }

    let builder = match configure(&matches) {
        Ok(builder) => builder,
        Err(e) => {
            error!("{}", e);
            print_usage(program, &opts);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let (_router, server) = match builder.build() {
            Ok(built) => built,
            Err(e) => {
                error!("Failed to start edge service: {}", e);
                return ExitCode::FAILURE;
            }
        };

        info!("abtest edge service configured");

        match server.await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Edge service stopped: {}", e);
                ExitCode::FAILURE
            }
        }
    })
}
