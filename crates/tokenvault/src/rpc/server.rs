use crate::{
    errors::{classify, ToolError},
    rpc::{
        jsonrpc::{self, JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_REQUEST},
        router::RequestRouter,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tracing::{debug, info, warn};

pub const MAX_JSONRPC_LINE_BYTES: usize = 1_000_000;

#[derive(Debug, Deserialize)]
struct JsonRpcNotification {
    jsonrpc: String,
}

async fn write_frame<W, T>(out: &mut W, v: &T) -> eyre::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send,
    T: serde::Serialize + Sync,
{
    out.write_all(format!("{}\n", serde_json::to_string(v)?).as_bytes())
        .await?;
    out.flush().await?;
    Ok(())
}

fn parse_jsonrpc_line(line: &str) -> Option<Result<JsonRpcRequest, (Value, i64, &'static str)>> {
    let req_v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping unparseable jsonrpc line");
            return None;
        }
    };

    if req_v.get("id").is_none() {
        if let Ok(note) = serde_json::from_value::<JsonRpcNotification>(req_v.clone()) {
            if note.jsonrpc == "2.0" {
                return None;
            }
        }
    }

    let req: JsonRpcRequest = match serde_json::from_value(req_v) {
        Ok(parsed_req) => parsed_req,
        Err(e) => {
            warn!(error = %e, "failed to parse jsonrpc request");
            return None;
        }
    };

    if req.jsonrpc != "2.0" {
        return Some(Err((req.id, INVALID_REQUEST, "invalid jsonrpc version")));
    }

    Some(Ok(req))
}

fn handle_request(router: &RequestRouter, req: JsonRpcRequest) -> JsonRpcResponse {
    if req.method == "ping" {
        return jsonrpc::ok(req.id, json!({}));
    }

    match router.dispatch(&req.method, &req.params) {
        Ok(result) => jsonrpc::ok(req.id, result),
        Err(e) => {
            if let Some(kind) = classify(&e) {
                debug!(method = %req.method, code = kind.code(), "call failed");
                jsonrpc::tool_err(req.id, kind.rpc_code(), &ToolError::from(kind.clone()))
            } else {
                warn!(method = %req.method, error = %e, "internal error");
                jsonrpc::tool_err(
                    req.id,
                    INTERNAL_ERROR,
                    &ToolError::new("internal_error", format!("{e:#}")),
                )
            }
        }
    }
}

/// Answer newline-delimited JSON-RPC requests from `input` until EOF, one call at a time.
pub async fn serve<R, W>(router: &RequestRouter, input: R, mut out: W) -> eyre::Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_JSONRPC_LINE_BYTES {
            warn!(len = line.len(), "jsonrpc line too large; closing");
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let req = match parse_jsonrpc_line(&line) {
            Some(Ok(parsed)) => parsed,
            Some(Err((id, code, msg))) => {
                write_frame(&mut out, &jsonrpc::err(id, code, msg)).await?;
                continue;
            }
            None => continue,
        };

        let resp = handle_request(router, req);
        write_frame(&mut out, &resp).await?;
    }

    Ok(())
}

pub async fn run_stdio(router: &RequestRouter) -> eyre::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "serving on stdio");
    serve(router, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::VaultConfig, kv::MemoryKvStore};
    use eyre::ContextCompat as _;
    use std::sync::Arc;
    use zeroize::Zeroizing;

    async fn run(input: &str) -> eyre::Result<Vec<Value>> {
        let router = RequestRouter::new(
            Arc::new(MemoryKvStore::new()),
            Zeroizing::new([9_u8; 32]),
            &VaultConfig::default(),
        )?;
        let mut out = Vec::new();
        serve(&router, input.as_bytes(), &mut out).await?;
        String::from_utf8(out)?
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).map_err(eyre::Report::from))
            .collect()
    }

    #[tokio::test]
    async fn answers_in_order_and_skips_notifications() -> eyre::Result<()> {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"initialized"}"#, "\n",
            "not json\n",
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"listTokens","params":{"context":{"address":"0x00000000000000000000000000000000000000aa","chainId":1}}}"#, "\n",
        );
        let resps = run(input).await?;
        assert_eq!(resps.len(), 2);
        let first = resps.first().context("first")?;
        assert_eq!(first.get("id"), Some(&json!(1)));
        assert_eq!(first.get("result"), Some(&json!({})));
        let second = resps.get(1).context("second")?;
        assert_eq!(second.get("id"), Some(&json!(2)));
        assert_eq!(second.pointer("/result/tokens"), Some(&json!([])));
        Ok(())
    }

    #[tokio::test]
    async fn errors_carry_kind_in_data() -> eyre::Result<()> {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":"a","method":"stealKeys"}"#, "\n",
            r#"{"jsonrpc":"2.0","id":"b","method":"listTokens"}"#, "\n",
            r#"{"jsonrpc":"2.0","id":"c","method":"importToken","params":{"tokenKind":"ERC20"}}"#, "\n",
            r#"{"jsonrpc":"1.0","id":"d","method":"ping"}"#, "\n",
        );
        let resps = run(input).await?;
        let codes: Vec<_> = resps
            .iter()
            .map(|r| {
                (
                    r.pointer("/error/code").and_then(Value::as_i64),
                    r.pointer("/error/data/code").and_then(Value::as_str),
                )
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                (Some(-32601), Some("unsupported_method")),
                (Some(-32000), Some("no_active_account")),
                (Some(-32602), Some("invalid_request")),
                (Some(-32600), None),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn oversized_line_closes_the_stream() -> eyre::Result<()> {
        let big = format!(
            "{{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"params\":{{\"pad\":\"{}\"}}}}\n{}\n",
            "x".repeat(MAX_JSONRPC_LINE_BYTES),
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
        );
        assert!(run(&big).await?.is_empty());
        Ok(())
    }
}
