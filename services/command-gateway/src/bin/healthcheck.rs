//! Health-check utility for load balancers and deploy hooks.
//!
//! Exit codes: 0 healthy, 1 generic failure, 2 configuration error,
//! 3 unreachable, 4 unauthorised.

use std::process::ExitCode;
use std::time::Duration;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_UNREACHABLE: u8 = 3;
const EXIT_UNAUTHORISED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let base_url = match std::env::args().nth(1).or_else(|| std::env::var("GATEWAY_URL").ok()) {
        Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
        _ => {
            eprintln!("usage: healthcheck <gateway-url> (or set GATEWAY_URL)");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        eprintln!("gateway url must be http(s): {base_url}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let timeout = Duration::from_millis(
        std::env::var("HEALTHCHECK_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(3_000),
    );
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(error) => {
            eprintln!("failed to build http client: {error}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let mut request = client.get(format!("{base_url}/healthz"));
    if let Ok(api_key) = std::env::var("GATEWAY_API_KEY") {
        request = request.header("x-api-key", api_key);
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                println!("ok");
                ExitCode::from(EXIT_OK)
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                eprintln!("unauthorised: {status}");
                ExitCode::from(EXIT_UNAUTHORISED)
            } else {
                eprintln!("unhealthy: {status}");
                ExitCode::from(EXIT_FAILURE)
            }
        }
        Err(error) if error.is_timeout() || error.is_connect() => {
            eprintln!("unreachable: {error}");
            ExitCode::from(EXIT_UNREACHABLE)
        }
        Err(error) => {
            eprintln!("request failed: {error}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
