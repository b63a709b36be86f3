//! Wire-level checks: exact bytes for the fixed-layout frames and full
//! round-trips through the codec and a compressor/decompressor pair.

use bytes::Bytes;
use spdymux::{
    DataFrame, Decoded, Frame, FrameCodec, HeaderCompressor, HeaderDecompressor, Headers,
    PingFrame, RstStatus, RstStreamFrame, Setting, SettingsFrame, SynStreamFrame, Version,
    setting,
};

async fn encode(version: Version, frame: &Frame) -> Vec<u8> {
    let mut codec = FrameCodec::new(version);
    let mut comp = HeaderCompressor::new(version).unwrap();
    let mut wire = Vec::new();
    codec.write_frame(&mut wire, frame, &mut comp).await.unwrap();
    wire
}

async fn decode(version: Version, wire: &[u8]) -> Frame {
    let mut codec = FrameCodec::new(version);
    let mut decomp = HeaderDecompressor::new(version);
    let mut reader = wire;
    match codec
        .read_frame(&mut reader, &mut decomp)
        .await
        .unwrap()
        .unwrap()
    {
        Decoded::Frame(frame) => frame,
        other => panic!("expected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_wire_layout() {
    let wire = encode(
        Version::V3,
        &Frame::Ping(PingFrame {
            version: Version::V3,
            id: 0x0102,
        }),
    )
    .await;
    assert_eq!(
        wire,
        [0x80, 0x03, 0x00, 0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x01, 0x02]
    );
}

#[tokio::test]
async fn data_wire_layout() {
    let wire = encode(
        Version::V3,
        &Frame::Data(DataFrame::new(5, Bytes::from_static(b"ab"), true)),
    )
    .await;
    assert_eq!(
        wire,
        [0x00, 0x00, 0x00, 0x05, 0x01, 0x00, 0x00, 0x02, b'a', b'b']
    );
}

#[tokio::test]
async fn rst_stream_wire_layout() {
    let wire = encode(
        Version::V3,
        &Frame::RstStream(RstStreamFrame::new(Version::V3, 3, RstStatus::Cancel)),
    )
    .await;
    assert_eq!(
        wire,
        [0x80, 0x03, 0x00, 0x03, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00,
         0x00, 0x05]
    );
}

#[tokio::test]
async fn settings_id_byte_order_differs_by_version() {
    let frame = |version| {
        Frame::Settings(SettingsFrame {
            version,
            clear_persisted: false,
            entries: vec![Setting {
                flags: 0,
                id: setting::MAX_CONCURRENT_STREAMS,
                value: 1000,
            }],
        })
    };
    let v2 = encode(Version::V2, &frame(Version::V2)).await;
    let v3 = encode(Version::V3, &frame(Version::V3)).await;
    // Entry starts after the 8-byte frame header and 4-byte count.
    // Draft 2: 24-bit little-endian id then flags.
    assert_eq!(&v2[12..16], [0x04, 0x00, 0x00, 0x00]);
    // Draft 3: flags then 24-bit big-endian id.
    assert_eq!(&v3[12..16], [0x00, 0x00, 0x00, 0x04]);
    assert_eq!(&v2[16..20], 1000u32.to_be_bytes());
    assert_eq!(&v3[16..20], 1000u32.to_be_bytes());
}

#[tokio::test]
async fn syn_stream_survives_compression_round_trip() {
    for version in [Version::V2, Version::V3] {
        let mut headers = Headers::new();
        headers.insert(":method".into(), vec!["POST".into()]);
        headers.insert(":path".into(), vec!["/submit".into()]);
        headers.insert("cookie".into(), vec!["a=1".into(), "b=2".into()]);
        let frame = Frame::SynStream(SynStreamFrame {
            version,
            stream_id: 1,
            associated_stream_id: 0,
            priority: 1,
            slot: 0,
            headers,
            fin: false,
            unidirectional: false,
        });
        let wire = encode(version, &frame).await;
        assert_eq!(decode(version, &wire).await, frame);
    }
}

#[tokio::test]
async fn header_blocks_stay_decodable_across_a_connection() {
    // One compressor/decompressor pair serves every frame on a connection;
    // blocks must decode in order even as the shared window evolves.
    let version = Version::V3;
    let mut codec = FrameCodec::new(version);
    let mut comp = HeaderCompressor::new(version).unwrap();
    let mut decomp = HeaderDecompressor::new(version);
    let mut wire = Vec::new();
    let mut frames = Vec::new();
    for i in (1..=9u32).step_by(2) {
        let mut headers = Headers::new();
        headers.insert(":method".into(), vec!["GET".into()]);
        headers.insert(":path".into(), vec![format!("/resource/{i}")]);
        let frame = Frame::SynStream(SynStreamFrame {
            version,
            stream_id: i,
            associated_stream_id: 0,
            priority: 0,
            slot: 0,
            headers,
            fin: false,
            unidirectional: false,
        });
        codec.write_frame(&mut wire, &frame, &mut comp).await.unwrap();
        frames.push(frame);
    }
    let mut reader = &wire[..];
    for expected in frames {
        match codec
            .read_frame(&mut reader, &mut decomp)
            .await
            .unwrap()
            .unwrap()
        {
            Decoded::Frame(frame) => assert_eq!(frame, expected),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}
