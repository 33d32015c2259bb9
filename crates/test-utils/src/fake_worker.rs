//! Client half of the coordination server, as a worker process would speak it.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use qa::protocol::Record;
use qa::server::ServerAddress;

/// Dial `address` and present its token.
pub async fn dial(address: &ServerAddress) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(address.addr).await?;
    stream.write_all(address.token.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    Ok(stream)
}

/// Stream `records` into a sink address, then hang up.
pub async fn send_records(address: &ServerAddress, records: &[Record]) -> anyhow::Result<()> {
    let lines: Vec<String> = records
        .iter()
        .map(|r| r.to_line())
        .collect::<Result<_, _>>()?;
    send_lines(address, &lines).await
}

/// Stream raw lines into a sink address, then hang up.
pub async fn send_lines(address: &ServerAddress, lines: &[String]) -> anyhow::Result<()> {
    let mut stream = dial(address).await?;
    for line in lines {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Read every line from a queue address until the server closes it.
pub async fn read_queue(address: &ServerAddress) -> anyhow::Result<Vec<String>> {
    let stream = dial(address).await?;
    let mut lines = BufReader::new(stream).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    Ok(out)
}
