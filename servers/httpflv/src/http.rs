use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::errors::{HttpFlvSessionError, HttpFlvSessionResult};

const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Reads the request line and headers off the raw socket, consuming exactly
/// through the blank line.
pub async fn parse_http_header<R>(
    reader: &mut R,
) -> HttpFlvSessionResult<(String, HashMap<String, String>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut first_line = String::new();
    let n = reader.read_line(&mut first_line).await?;
    if n == 0 {
        return Err(HttpFlvSessionError::InvalidHttpRequest(
            "connection closed before request line".to_string(),
        ));
    }
    let first_line = first_line.trim_end_matches(['\r', '\n']).to_string();

    let mut headers = HashMap::new();
    let mut total = first_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(HttpFlvSessionError::InvalidHttpRequest(
                "connection closed inside headers".to_string(),
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        total += line.len();
        if total > MAX_HEADER_BYTES {
            return Err(HttpFlvSessionError::InvalidHttpRequest(
                "request headers too large".to_string(),
            ));
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.insert(name.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(HttpFlvSessionError::InvalidHttpRequest(format!(
                    "bad header line: {}",
                    line
                )));
            }
        }
    }
    Ok((first_line, headers))
}
