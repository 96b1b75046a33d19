use futures_util::StreamExt;
use reqwest::Body;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::progress::ProgressReporter;

/// Stream `reader` as a request body, feeding the running byte count
/// (starting at `offset`) to `reporter`
pub(crate) fn counting_body<R>(reader: R, reporter: ProgressReporter, offset: u64) -> Body
where
    R: AsyncRead + Send + 'static,
{
    let mut sent = offset;
    let stream = ReaderStream::new(reader).map(move |chunk_result| {
        let chunk = chunk_result?;
        sent += chunk.len() as u64;
        reporter.advance(sent);
        Ok::<_, io::Error>(chunk)
    });
    Body::wrap_stream(stream)
}
