//! Copy-paste descriptor exchange between the two operators.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::transport::Descriptor;

pub fn print_descriptor(label: &str, descriptor: &Descriptor) {
    println!("--- COPY THIS {} TO THE REMOTE OPERATOR ---", label);
    println!("{}", descriptor);
    println!("--- END {} ---", label);
}

/// Read the first non-blank line from `input` as a descriptor.
pub async fn read_descriptor<R>(prompt: &str, input: R) -> Result<Descriptor>
where
    R: AsyncBufRead + Unpin,
{
    eprintln!("{}", prompt);
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("Failed to read descriptor")? {
        if line.trim().is_empty() {
            continue;
        }
        return line.parse().context("Invalid descriptor");
    }
    bail!("input closed before a descriptor was provided")
}

pub async fn read_descriptor_from_stdin(prompt: &str) -> Result<Descriptor> {
    read_descriptor(prompt, BufReader::new(tokio::io::stdin())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skips_blank_lines() {
        let input: &[u8] = b"\n   \n  abcdef  \nignored\n";
        let descriptor = read_descriptor("paste:", input).await.unwrap();
        assert_eq!(descriptor.as_str(), "abcdef");
    }

    #[tokio::test]
    async fn test_eof_is_an_error() {
        let input: &[u8] = b"\n\n";
        assert!(read_descriptor("paste:", input).await.is_err());
    }
}
