use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", pretty(&err));
    std::process::exit(4);
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Everything needed to reach the API, shared by all commands.
pub struct Target<'a> {
    pub api_url: &'a str,
    pub token: Option<&'a str>,
    /// Print status and response headers alongside the body
    pub include: bool,
}

/// Execute an API request, print the response, return a structured exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(
    target: &Target<'_>,
    method: reqwest::Method,
    path: &str,
    body: Option<serde_json::Value>,
    query: &[(&str, String)],
) -> i32 {
    let url = match reqwest::Url::parse(&format!("{}{path}", target.api_url)) {
        Ok(mut u) => {
            if !query.is_empty() {
                let mut q = u.query_pairs_mut();
                for (k, v) in query {
                    q.append_pair(k, v);
                }
            }
            u
        }
        Err(e) => {
            let err = json!({
                "error": "cli_error",
                "message": format!("Invalid URL: {}{path}: {e}", target.api_url)
            });
            eprintln!("{}", pretty(&err));
            return 4;
        }
    };

    let mut req = client().request(method, url);

    if let Some(t) = target.token {
        req = req.header("Authorization", format!("Bearer {t}"));
    }

    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check TEES_API_URL."
            });
            eprintln!("{}", pretty(&err));
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for(status);

    // Collect headers before consuming response
    let headers: serde_json::Map<String, serde_json::Value> = if target.include {
        resp.headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or("<binary>"))))
            .collect()
    } else {
        serde_json::Map::new()
    };

    let resp_body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let output = if target.include {
        json!({
            "status": status,
            "headers": headers,
            "body": resp_body
        })
    } else {
        resp_body
    };

    if exit_code == 0 {
        println!("{}", pretty(&output));
    } else {
        eprintln!("{}", pretty(&output));
    }

    exit_code
}

fn exit_code_for(status: u16) -> i32 {
    match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    }
}
