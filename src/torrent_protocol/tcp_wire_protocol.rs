use anyhow::{bail, Result};
use core::str;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    join,
    net::TcpStream,
};

use crate::{
    bencoding::Value,
    torrent_protocol::wire_protocol::{
        Message, Protocol, ProtocolError, ProtocolReadHalf, ProtocolWriteHalf,
    },
};

// largest frame we are willing to buffer: a block transfer plus its header;
// anything bigger is a protocol violation
const MAX_MESSAGE_SIZE: u32 = 256 * 1024;

impl Protocol for TcpStream {
    async fn handshake(
        &mut self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        // peer_protocol, reserved, peer_info_hash, peer_id
    ) -> Result<(String, [u8; 8], [u8; 20], [u8; 20])> {
        let peer_addr = self.peer_addr()?;
        log::trace!("peer {}: performing handshake", &peer_addr);

        let (mut read, mut write) = tokio::io::split(self);

        let (write_result, read_result) = join!(
            // send
            async {
                log::trace!("peer {}: sending handshake", &peer_addr);
                let mut buf: [u8; 68] = [0; 68];
                buf[0] = 19;
                buf[1..20].copy_from_slice(b"BitTorrent protocol");
                buf[25] = 0x10; // advertise support for the extension protocol
                buf[28..48].copy_from_slice(&info_hash);
                buf[48..68].copy_from_slice(&peer_id);
                if let Err(e) = write.write_all(&buf).await {
                    Err(e)
                } else {
                    log::trace!("peer {}: full handshake sent", &peer_addr);
                    Ok(())
                }
            },
            // receive
            async {
                log::trace!("peer {}: receiving handshake", &peer_addr);

                let mut pstr_len_buf: [u8; 1] = [0; 1];
                if let Err(e) = read.read_exact(&mut pstr_len_buf).await {
                    return Err(e);
                }

                let mut pstr_buf: Vec<u8> = vec![0; pstr_len_buf[0].into()];
                if let Err(e) = read.read_exact(&mut pstr_buf).await {
                    return Err(e);
                }

                let pstr = str::from_utf8(&pstr_buf)
                    .unwrap_or("unknown non utf8 protocol string")
                    .to_string();

                let mut reserved_buf: [u8; 8] = [0; 8];
                if let Err(e) = read.read_exact(&mut reserved_buf).await {
                    return Err(e);
                }

                let mut info_hash_buf: [u8; 20] = [0; 20];
                if let Err(e) = read.read_exact(&mut info_hash_buf).await {
                    return Err(e);
                }

                let mut peer_id: [u8; 20] = [0; 20];
                if let Err(e) = read.read_exact(&mut peer_id).await {
                    return Err(e);
                }

                log::trace!("peer {}: full handshake received", &peer_addr);
                Ok((pstr, reserved_buf, info_hash_buf, peer_id))
            }
        );

        if let Err(e) = write_result {
            bail!(e);
        }
        let (pstr, reserved, peer_info_hash, peer_id) = read_result?;
        if pstr != "BitTorrent protocol" {
            bail!(ProtocolError::new(format!(
                "unsupported protocol string in handshake: {pstr}"
            )));
        }
        Ok((pstr, reserved, peer_info_hash, peer_id))
    }
}

impl ProtocolWriteHalf for WriteHalf<TcpStream> {
    async fn send(&mut self, message: Message) -> Result<()> {
        log::trace!("sending message: {}", message);
        match message {
            Message::KeepAlive => {
                let buf: [u8; 4] = [0; 4];
                self.write_all(&buf).await?;
            }
            Message::Choke => {
                let mut buf: [u8; 5] = [0; 5];
                buf[3] = 1;
                self.write_all(&buf).await?;
            }
            Message::Unchoke => {
                let mut buf: [u8; 5] = [0; 5];
                buf[3] = 1;
                buf[4] = 1;
                self.write_all(&buf).await?;
            }
            Message::Interested => {
                let mut buf: [u8; 5] = [0; 5];
                buf[3] = 1;
                buf[4] = 2;
                self.write_all(&buf).await?;
            }
            Message::NotInterested => {
                let mut buf: [u8; 5] = [0; 5];
                buf[3] = 1;
                buf[4] = 3;
                self.write_all(&buf).await?;
            }
            Message::Have(piece_num) => {
                let mut buf: [u8; 9] = [0; 9];
                buf[3] = 5;
                buf[4] = 4;
                buf[5..9].copy_from_slice(&piece_num.to_be_bytes());
                self.write_all(&buf).await?;
            }
            Message::Bitfield(bitfield) => {
                let buf = encode_bitfield(bitfield);
                self.write_all(&buf).await?;
            }
            Message::Request(index, begin, length) => {
                let mut buf: [u8; 17] = [0; 17];
                buf[3] = 13;
                buf[4] = 6;
                buf[5..9].copy_from_slice(&index.to_be_bytes());
                buf[9..13].copy_from_slice(&begin.to_be_bytes());
                buf[13..17].copy_from_slice(&length.to_be_bytes());
                self.write_all(&buf).await?;
            }
            Message::Piece(index, begin, block) => {
                let mut buf = vec![0; 13 + block.len()];
                buf[0..4].copy_from_slice(&(9 + block.len() as u32).to_be_bytes());
                buf[4] = 7;
                buf[5..9].copy_from_slice(&index.to_be_bytes());
                buf[9..13].copy_from_slice(&begin.to_be_bytes());
                buf[13..].copy_from_slice(&block);
                self.write_all(&buf).await?;
            }
            Message::Cancel(index, begin, length) => {
                let mut buf: [u8; 17] = [0; 17];
                buf[3] = 13;
                buf[4] = 8;
                buf[5..9].copy_from_slice(&index.to_be_bytes());
                buf[9..13].copy_from_slice(&begin.to_be_bytes());
                buf[13..17].copy_from_slice(&length.to_be_bytes());
                self.write_all(&buf).await?;
            }
            Message::Extended(id, value, additional_data) => {
                let encoded_value = value.encode();
                let mut buf = vec![0; 6 + encoded_value.len() + additional_data.len()];
                buf[0..4].copy_from_slice(
                    &(2 + encoded_value.len() as u32 + additional_data.len() as u32).to_be_bytes(),
                );
                buf[4] = 20;
                buf[5] = id;
                buf[6..6 + encoded_value.len()].copy_from_slice(&encoded_value);
                buf[6 + encoded_value.len()..].copy_from_slice(&additional_data);
                self.write_all(&buf).await?;
            }
        }
        Ok(())
    }
}

impl ProtocolReadHalf for ReadHalf<TcpStream> {
    async fn receive(&mut self) -> Result<Message> {
        // unknown message kinds are consumed and skipped, so loop until a
        // message we understand shows up
        loop {
            let mut size_message_buf: [u8; 4] = [0; 4];
            self.read_exact(&mut size_message_buf).await?;
            let size_message: u32 = u32::from_be_bytes(size_message_buf);
            if size_message == 0 {
                return Ok(Message::KeepAlive);
            }
            if size_message > MAX_MESSAGE_SIZE {
                bail!(ProtocolError::new(format!(
                    "refusing to read a message of {size_message} bytes"
                )));
            }

            let mut type_message_buf: [u8; 1] = [0; 1];
            self.read_exact(&mut type_message_buf).await?;
            match type_message_buf[0] {
                0 => return Ok(Message::Choke),
                1 => return Ok(Message::Unchoke),
                2 => return Ok(Message::Interested),
                3 => return Ok(Message::NotInterested),
                // have
                4 => {
                    if size_message != 5 {
                        bail!(ProtocolError::new(format!(
                            "have message with invalid length {size_message}"
                        )));
                    }
                    let mut buf: [u8; 4] = [0; 4];
                    self.read_exact(&mut buf).await?;
                    return Ok(Message::Have(u32::from_be_bytes(buf)));
                }
                // bitfield
                5 => {
                    let bitfield_byte_size: usize = (size_message - 1).try_into()?;
                    let mut buf = vec![0; bitfield_byte_size];
                    self.read_exact(&mut buf).await?;
                    return Ok(Message::Bitfield(decode_bitfield(buf)));
                }
                // request
                6 => {
                    if size_message != 13 {
                        bail!(ProtocolError::new(format!(
                            "request message with invalid length {size_message}"
                        )));
                    }
                    let mut buf: [u8; 12] = [0; 12];
                    self.read_exact(&mut buf).await?;
                    return Ok(Message::Request(
                        u32::from_be_bytes(buf[0..4].try_into()?),
                        u32::from_be_bytes(buf[4..8].try_into()?),
                        u32::from_be_bytes(buf[8..12].try_into()?),
                    ));
                }
                // piece
                7 => {
                    if size_message < 9 {
                        bail!(ProtocolError::new(format!(
                            "piece message of {size_message} bytes cannot carry a block header"
                        )));
                    }
                    let mut index_buf: [u8; 4] = [0; 4];
                    self.read_exact(&mut index_buf).await?;
                    let mut begin_buf: [u8; 4] = [0; 4];
                    self.read_exact(&mut begin_buf).await?;
                    let block_size: usize = (size_message - 9).try_into()?;
                    let mut block_buf = vec![0; block_size];
                    self.read_exact(&mut block_buf).await?;
                    return Ok(Message::Piece(
                        u32::from_be_bytes(index_buf),
                        u32::from_be_bytes(begin_buf),
                        block_buf,
                    ));
                }
                // cancel
                8 => {
                    if size_message != 13 {
                        bail!(ProtocolError::new(format!(
                            "cancel message with invalid length {size_message}"
                        )));
                    }
                    let mut buf: [u8; 12] = [0; 12];
                    self.read_exact(&mut buf).await?;
                    return Ok(Message::Cancel(
                        u32::from_be_bytes(buf[0..4].try_into()?),
                        u32::from_be_bytes(buf[4..8].try_into()?),
                        u32::from_be_bytes(buf[8..12].try_into()?),
                    ));
                }
                // extension message
                20 => {
                    if size_message < 2 {
                        bail!(ProtocolError::new(
                            "extension message without an extension id".to_string()
                        ));
                    }
                    let mut buf: [u8; 1] = [0; 1];
                    self.read_exact(&mut buf).await?;
                    let extended_message_id = buf[0]; // 0 means extension handshake
                    let payload_size: usize = (size_message - 2).try_into()?;
                    let mut buf = vec![0; payload_size];
                    self.read_exact(&mut buf).await?;
                    let (extended_message, dict_size) = Value::new_with_size(&buf);
                    return Ok(Message::Extended(
                        extended_message_id,
                        extended_message,
                        buf[dict_size..].to_vec(),
                    ));
                }
                unknown_message_id => {
                    // consume the payload and move on to the next frame
                    let skip_size: usize = (size_message - 1).try_into()?;
                    let mut skip_buf = vec![0; skip_size];
                    self.read_exact(&mut skip_buf).await?;
                    log::trace!(
                        "skipped unknown message type id {unknown_message_id} of {size_message} bytes"
                    );
                }
            }
        }
    }
}

fn decode_bitfield(buf: Vec<u8>) -> Vec<bool> {
    let mut bitfield = vec![false; buf.len() * 8];
    for i in 0..buf.len() {
        let mut mask: u8 = 0b10000000;
        for j in 0..8 {
            bitfield[i * 8 + j] = (buf[i] & mask) != 0;
            mask >>= 1;
        }
    }
    bitfield
}

fn encode_bitfield(bitfield: Vec<bool>) -> Vec<u8> {
    let bitfield_bytes = (bitfield.len() / 8) + if bitfield.len() % 8 != 0 { 1 } else { 0 };
    let mut buf = vec![0; 5 + bitfield_bytes];
    let bitfield_bytes_u32: u32 = bitfield_bytes
        .try_into()
        .expect("number of bytes holding bitfield should always fit an u32");
    buf[0..4].copy_from_slice(&(1 + bitfield_bytes_u32).to_be_bytes());
    buf[4] = 5;
    for i in 0..bitfield_bytes {
        let mut bitfield_byte: u8 = 0;
        let mut mask: u8 = 0b10000000;
        for j in 0..8 {
            if bitfield.len() <= i * 8 + j {
                break;
            }
            if bitfield[i * 8 + j] {
                bitfield_byte |= mask;
            }
            mask >>= 1;
        }
        buf[5 + i] = bitfield_byte;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn decode_bitfield_test() {
        let buf = vec![0b10000001, 0b00001100];
        let bitfield = decode_bitfield(buf);
        assert_eq!(
            *bitfield,
            vec![
                true, false, false, false, false, false, false, true, // byte 1
                false, false, false, false, true, true, false, false // byte 2
            ]
        )
    }

    #[test]
    fn encode_bitfield_partial_byte() {
        let bitfield = vec![
            true, false, false, false, false, false, false, true, // byte 1
            false, false, false, false, true, true, // byte 2, only 6 bits
        ];
        let buf = encode_bitfield(bitfield);
        assert_eq!(
            buf,
            vec![
                0, 0, 0, 3, // len
                5, // type
                0b10000001, 0b00001100 // bitfield bits
            ]
        );
    }

    #[test]
    fn encode_bitfield_full_bytes() {
        let bitfield = vec![
            true, false, false, false, false, false, false, true, // byte 1
            false, false, false, false, true, true, false, true, // byte 2
        ];
        let buf = encode_bitfield(bitfield);
        assert_eq!(
            buf,
            vec![
                0, 0, 0, 3, // len
                5, // type
                0b10000001, 0b00001101 // bitfield bits
            ]
        );
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn framing_round_trip() {
        let (client, server) = connected_pair().await;
        let (_, mut write) = tokio::io::split(client);
        let (mut read, _) = tokio::io::split(server);

        let sent = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Request(1, 16384, 16384),
            Message::Piece(1, 16384, vec![0xab; 1024]),
            Message::Cancel(1, 16384, 16384),
        ];
        for m in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Request(1, 16384, 16384),
            Message::Piece(1, 16384, vec![0xab; 1024]),
            Message::Cancel(1, 16384, 16384),
        ] {
            write.send(m).await.unwrap();
        }

        for expected in sent {
            let received = read.receive().await.unwrap();
            assert_eq!(received, expected);
        }
    }

    #[tokio::test]
    async fn bitfield_round_trip_is_byte_padded() {
        let (client, server) = connected_pair().await;
        let (_, mut write) = tokio::io::split(client);
        let (mut read, _) = tokio::io::split(server);

        let bits = vec![true, false, true, false, false, false, false, false, true];
        write.send(Message::Bitfield(bits.clone())).await.unwrap();
        match read.receive().await.unwrap() {
            Message::Bitfield(received) => {
                // the wire carries whole bytes, trailing padding is false
                assert_eq!(received.len(), 16);
                assert_eq!(&received[..9], bits.as_slice());
                assert!(received[9..].iter().all(|b| !b));
            }
            other => panic!("expected bitfield, got {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_message_ids_are_skipped() {
        let (client, server) = connected_pair().await;
        let (_, mut raw_write) = tokio::io::split(client);
        let (mut read, _) = tokio::io::split(server);

        // a port message (id 9, from the DHT extension) followed by a have:
        // the unknown frame must be consumed silently
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.push(9);
        bytes.extend_from_slice(&6881u16.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.push(4);
        bytes.extend_from_slice(&7u32.to_be_bytes());
        raw_write.write_all(&bytes).await.unwrap();

        assert_eq!(read.receive().await.unwrap(), Message::Have(7));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_protocol_error() {
        let (client, server) = connected_pair().await;
        let (_, mut raw_write) = tokio::io::split(client);
        let (mut read, _) = tokio::io::split(server);

        raw_write
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read.receive().await.is_err());
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let (mut client, mut server) = connected_pair().await;
        let info_hash = [0x11; 20];
        let client_id = *b"-UW0001-000000000001";
        let server_id = *b"-UW0001-000000000002";
        let (client_result, server_result) = tokio::join!(
            client.handshake(info_hash, client_id),
            server.handshake(info_hash, server_id)
        );
        let (pstr, _reserved, peer_info_hash, peer_id) = client_result.unwrap();
        assert_eq!(pstr, "BitTorrent protocol");
        assert_eq!(peer_info_hash, info_hash);
        assert_eq!(peer_id, server_id);
        let (_, reserved, _, peer_id) = server_result.unwrap();
        assert_eq!(peer_id, client_id);
        // the extension protocol bit is advertised
        assert_eq!(reserved[5] & 0x10, 0x10);
    }
}
