use serde_json::Value;
use tabmesh_core::message::PeerCallRequest;
use tabmesh_core::{Config, ExtraArgs, Paths};

use super::{base_url, locate_listener};

fn parse_args(raw: Option<String>) -> anyhow::Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Value>(&raw)? {
        Value::Array(items) => Ok(items),
        single => Ok(vec![single]),
    }
}

pub async fn run(
    peer_id: String,
    procedure: String,
    args: Option<String>,
    tab_id: Option<i64>,
    window_id: Option<i64>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let port = locate_listener(&config, port).await?;

    let request = PeerCallRequest {
        procedure,
        args: parse_args(args)?,
        extra_args: ExtraArgs {
            tab_id,
            window_id,
            ..Default::default()
        },
    };
    let url = format!("{}/v1/peers/{}/call", base_url(&config, port), peer_id);
    let resp = reqwest::Client::new().post(&url).json(&request).send().await?;
    let status = resp.status();
    let body: Value = resp.json().await?;
    if !status.is_success() {
        let reason = body.get("error").and_then(|v| v.as_str()).unwrap_or("request failed");
        anyhow::bail!("{} ({})", reason, status);
    }

    let result = body.get("result").cloned().unwrap_or(Value::Null);
    if body.get("isOk").and_then(|v| v.as_bool()) == Some(true) {
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    } else {
        anyhow::bail!("call failed: {}", serde_json::to_string(&result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_accepts_array_or_scalar() {
        assert!(parse_args(None).unwrap().is_empty());
        assert_eq!(parse_args(Some("[1, \"a\"]".into())).unwrap(), vec![json!(1), json!("a")]);
        assert_eq!(parse_args(Some("\"#main\"".into())).unwrap(), vec![json!("#main")]);
        assert!(parse_args(Some("not json".into())).is_err());
    }
}
