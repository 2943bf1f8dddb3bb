//! TCP server for handling HTTP connections.
//!
//! Accepts connections, parses requests, and dispatches them to the
//! targets by path.

use crate::bins::BinStore;
use crate::capture::{self, Route};
use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::protocol::{
    BodyFraming, ChunkedDecoder, ChunkedResult, HttpRequest, ParseError, ParseResult, Parser, Response, CONTINUE,
};
use crate::targets::{raw_input, url_or_body, TargetContext};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Maps request paths to targets
pub struct Router {
    raw_input: String,
    url_or_body: String,
    context: TargetContext,
    bins: Arc<BinStore>,
}

impl Router {
    pub fn new(config: &Config, fetcher: Fetcher, bins: Arc<BinStore>) -> Self {
        Router {
            raw_input: config.raw_input_route.clone(),
            url_or_body: config.url_or_body_route.clone(),
            context: TargetContext {
                fetcher,
                inline_warnings: config.inline_warnings,
            },
            bins,
        }
    }

    /// Produce the response for a complete request
    pub async fn respond(&self, request: &HttpRequest, peer: SocketAddr) -> Response {
        let path = request.head.path.as_str();
        if path == self.raw_input {
            Response::ok(raw_input::handle(&request.body))
        } else if path == self.url_or_body {
            Response::ok(url_or_body::handle(request, &self.context).await)
        } else if path == "/" {
            Response::ok(self.index())
        } else if let Some(route) = Route::parse(path) {
            capture::respond(route, request, peer, &self.bins)
        } else {
            Response::not_found(path)
        }
    }

    fn index(&self) -> String {
        format!(
            "{raw}\n    echo the body, then each non-blank text node on its own line\n\
             {dom}?url=<location>&xxe=true\n    echo the document from url or body, then the re-serialized DOM;\n    \
             xxe=true expands external entities\n\
             /_/<bin>/...\n    capture any request into a bin\n\
             /api/bins, /api/bins/<bin>\n    list bins, or the latest requests of one\n\
             /<bin>/redirect/<kind>\n    redirect to a local file or metadata address (self: back into the bin)\n",
            raw = self.raw_input,
            dom = self.url_or_body,
        )
    }
}

/// Server instance
pub struct Server {
    config: Config,
    router: Arc<Router>,
    bins: Arc<BinStore>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, FetchError> {
        let fetcher = Fetcher::new(config.fetch_timeout, &config.user_agent)?;
        let bins = BinStore::new(config.bin_ttl);
        let router = Router::new(&config, fetcher, Arc::clone(&bins));

        Ok(Server {
            config,
            router: Arc::new(router),
            bins,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    /// Start the server and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        // Start the bin expiration cleanup task
        let bins = Arc::clone(&self.bins);
        let cleanup_interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            cleanup_task(bins, cleanup_interval).await;
        });

        self.serve(listener).await
    }

    /// Accept connections on a bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let router = Arc::clone(&self.router);
                    let max_body = self.config.max_body_size;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, router, max_body).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Periodically drop expired bins
async fn cleanup_task(bins: Arc<BinStore>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;
        let count = bins.cleanup_expired();
        if count > 0 {
            debug!(count, "Cleaned up expired bins");
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    max_body: usize,
) -> ConnectionResult {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let (head, consumed) = match Parser::parse_head(&buffer) {
            ParseResult::Complete(head, consumed) => (head, consumed),
            ParseResult::Error(ParseError::Incomplete) => {
                let n = stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    trace!("Connection closed by client");
                    return Ok(());
                }
                continue;
            }
            ParseResult::Error(e) => return reject(&mut stream, e).await,
        };

        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(e) => return reject(&mut stream, e).await,
        };
        if let BodyFraming::Length(length) = framing {
            if length > max_body {
                return reject(&mut stream, ParseError::BodyTooLarge(max_body)).await;
            }
        }

        // Only ask for the body if the client has not started sending it
        if head.expects_continue() && framing != BodyFraming::Empty && buffer.len() == consumed {
            stream.write_all(CONTINUE).await?;
        }
        buffer.advance(consumed);

        let body = match framing {
            BodyFraming::Empty => Bytes::new(),
            BodyFraming::Length(length) => {
                while buffer.len() < length {
                    if stream.read_buf(&mut buffer).await? == 0 {
                        trace!("Connection closed mid-body");
                        return Ok(());
                    }
                }
                buffer.split_to(length).freeze()
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new(max_body);
                loop {
                    match decoder.decode(&mut buffer) {
                        ChunkedResult::Complete(body) => break body,
                        ChunkedResult::Error(ParseError::Incomplete) => {
                            if stream.read_buf(&mut buffer).await? == 0 {
                                trace!("Connection closed mid-body");
                                return Ok(());
                            }
                        }
                        ChunkedResult::Error(e) => return reject(&mut stream, e).await,
                    }
                }
            }
        };

        let keep_alive = head.keep_alive();
        let head_only = head.method == "HEAD";
        let request = HttpRequest::new(head, body);
        trace!(uri = %request.head.target, body = request.body.len(), "Processing request");

        let response = router.respond(&request, peer).await;
        info!(
            method = %request.head.method,
            path = %request.head.path,
            status = response.status.0,
            bytes = response.body.len(),
            "Request served"
        );

        stream
            .write_all(&response.encode(keep_alive, head_only))
            .await?;

        if !keep_alive {
            return Ok(());
        }
    }
}

/// Answer an unparseable request and close the connection
async fn reject(stream: &mut TcpStream, error: ParseError) -> ConnectionResult {
    warn!(error = %error, "Rejecting request");
    let response = Response::for_error(&error);
    stream.write_all(&response.encode(false, false)).await?;
    Ok(())
}
