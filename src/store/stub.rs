use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub(crate) async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/solr", listener.local_addr().unwrap());
    (listener, url)
}

// Answers one canned response per connection and records each request, head and body.
pub(crate) fn serve(listener: TcpListener, responses: Vec<(u16, String)>) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        for (code, body) in responses {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                head.push_str(&line);
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).await.unwrap();
            head.push_str(&String::from_utf8_lossy(&request_body));
            log.lock().unwrap().push(head);

            let reply = format!(
                "HTTP/1.1 {code} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let mut stream = reader.into_inner();
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
    });
    seen
}

// Cluster status advertising `base_url` as the single active replica of `solrtest`.
pub(crate) fn single_node_status(base_url: &str) -> String {
    format!(
        r#"{{"cluster": {{"live_nodes": ["n1"], "collections": {{"solrtest": {{"shards": {{
            "shard1": {{"state": "active", "replicas": {{
                "r1": {{"base_url": "{base_url}", "node_name": "n1", "state": "active"}}}}}}}}}}}}}}}}"#
    )
}
