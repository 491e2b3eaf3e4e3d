//! Wire-Format fuer den TCP-Transport
//!
//! Jede [`RoomMessage`] wird als ein Frame uebertragen:
//!
//! ```text
//! +--------+--------+--------+--------+----...----+
//! | Laenge (u32 BE)                   | JSON       |
//! +--------+--------+--------+--------+----...----+
//! ```
//!
//! Die Laenge zaehlt nur die Payload-Bytes. Audio-Chunks sind klein (ein
//! 10-ms-Opus-Frame), daher reicht ein Limit von 256 KB pro Frame.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::room::RoomMessage;

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Frame-Groesse (256 KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Groesse des Laengen-Felds in Bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

fn ungueltig(text: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, text)
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer `Framed<TcpStream, FrameCodec>`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = RoomMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let laenge = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if laenge > self.max_frame_size {
            return Err(ungueltig(format!(
                "Frame zu gross: {} Bytes (Maximum: {} Bytes)",
                laenge, self.max_frame_size
            )));
        }

        let gesamt = LENGTH_FIELD_SIZE + laenge;
        if src.len() < gesamt {
            src.reserve(gesamt - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let payload = src.split_to(laenge);

        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| ungueltig(format!("JSON-Deserialisierung fehlgeschlagen: {e}")))
    }
}

impl Encoder<RoomMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RoomMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| ungueltig(format!("JSON-Serialisierung fehlgeschlagen: {e}")))?;

        if json.len() > self.max_frame_size {
            return Err(ungueltig(format!(
                "Nachricht zu gross: {} Bytes (Maximum: {} Bytes)",
                json.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(LENGTH_FIELD_SIZE + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::types::{RoomId, UserId};

    fn sprecher_nachricht(aktiv: bool) -> RoomMessage {
        RoomMessage::UserSpeaking {
            user_id: UserId::new(),
            is_speaking: aktiv,
        }
    }

    #[test]
    fn laengenfeld_entspricht_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(sprecher_nachricht(true), &mut buf).unwrap();

        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(buf.len(), LENGTH_FIELD_SIZE + payload_len);
        assert_eq!(buf[LENGTH_FIELD_SIZE], b'{');
    }

    #[test]
    fn unvollstaendiger_frame_wartet() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                RoomMessage::AudioStream {
                    room_id: RoomId::new(),
                    user_id: UserId::new(),
                    audio: vec![7; 64],
                },
                &mut buf,
            )
            .unwrap();

        let mut teil = buf.split_to(buf.len() / 2);
        assert!(codec.decode(&mut teil).unwrap().is_none());
        assert!(codec.decode(&mut BytesMut::from(&[0u8, 0][..])).unwrap().is_none());
    }

    #[test]
    fn zu_grosser_frame_wird_abgelehnt() {
        let mut codec = FrameCodec::with_max_size(100);
        let mut buf = BytesMut::new();
        buf.put_u32(200);
        buf.put_slice(&[b'x'; 200]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        let mut winzig = FrameCodec::with_max_size(10);
        assert!(winzig.encode(sprecher_nachricht(false), &mut buf).is_err());
    }

    #[test]
    fn kaputtes_json_ist_fehler() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"{nope");
        let fehler = codec.decode(&mut buf).unwrap_err();
        assert_eq!(fehler.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn mehrere_nachrichten_hintereinander() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let nachrichten = vec![
            sprecher_nachricht(true),
            RoomMessage::UserLeft {
                user_id: UserId::new(),
            },
            sprecher_nachricht(false),
        ];
        for n in &nachrichten {
            codec.encode(n.clone(), &mut buf).unwrap();
        }
        for erwartet in &nachrichten {
            let msg = codec.decode(&mut buf).unwrap().expect("Nachricht erwartet");
            assert_eq!(&msg, erwartet);
        }
        assert!(buf.is_empty());
    }
}
