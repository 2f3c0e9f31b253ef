use bytes::Bytes;
use devtun_core::ChunkStream;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io;
use tokio_util::io::StreamReader;

pub type ChunkReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Present a chunk stream as a byte reader.
pub fn chunk_reader(stream: ChunkStream) -> ChunkReader {
    StreamReader::new(
        stream
            .map(|chunk| chunk.map(|c| c.content).map_err(io::Error::other))
            .boxed(),
    )
}
