use bytes::Bytes;
use netgate::{Frame, FrameCodec, PooledBuffer, FRAME_HEADER_SIZE};
use rstest::rstest;

fn sample_frames() -> Vec<Frame> {
    let mut frames = Vec::new();
    for i in 0..12u16 {
        let body = match i % 4 {
            // an empty body is a legal frame of exactly header size
            0 => Vec::new(),
            1 => b"PING".to_vec(),
            2 => vec![i as u8; 100],
            _ => format!("frame-{}", i).into_bytes(),
        };
        frames.push(Frame::with_timestamp(i, 1_700_000_000_000 + i as i64, Bytes::from(body)));
    }
    frames
}

fn wire_bytes(codec: &FrameCodec, frames: &[Frame]) -> Vec<u8> {
    let mut wire = Vec::new();
    for frame in frames {
        wire.extend_from_slice(&codec.encode_to_bytes(frame).unwrap());
    }
    wire
}

/// Feeds the encoded stream to a receive buffer in fixed-size chunks and
/// drains the decoder after every chunk, the way the receive loop does.
fn decode_chunked(codec: &FrameCodec, wire: &[u8], chunk_size: usize) -> Vec<(u16, Vec<u8>)> {
    let mut buf = PooledBuffer::with_capacity(4096);
    let mut decoded = Vec::new();
    let mut offset = 0;
    while offset < wire.len() {
        let n = chunk_size.min(wire.len() - offset);
        let space = buf.open(n).unwrap();
        space.copy_from_slice(&wire[offset..offset + n]);
        buf.commit(n).unwrap();
        offset += n;

        loop {
            let step = match codec.decode(buf.unread_bytes()).unwrap() {
                Some((view, consumed)) => {
                    decoded.push((view.message_id, view.body.to_vec()));
                    consumed
                }
                None => break,
            };
            buf.take(step).unwrap();
        }
        buf.compact();
    }
    decoded
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(5)]
#[case(11)]
#[case(16)]
#[case(64)]
#[case(1024)]
fn test_round_trip_under_arbitrary_chunking(#[case] chunk_size: usize) {
    let codec = FrameCodec::new(4096);
    let frames = sample_frames();
    let wire = wire_bytes(&codec, &frames);

    let decoded = decode_chunked(&codec, &wire, chunk_size);

    assert_eq!(decoded.len(), frames.len());
    for (frame, (id, body)) in frames.iter().zip(decoded.iter()) {
        assert_eq!(frame.message_id, *id);
        assert_eq!(frame.body.as_ref(), body.as_slice());
    }
}

#[test]
fn test_two_concatenated_frames_decode_in_one_pass() {
    let codec = FrameCodec::new(4096);
    let frames = vec![
        Frame::new(10, Bytes::from_static(b"first")),
        Frame::new(20, Bytes::from_static(b"second")),
    ];
    let wire = wire_bytes(&codec, &frames);

    // a single receive delivering both frames yields both, in order,
    // consuming the exact combined byte count
    let decoded = decode_chunked(&codec, &wire, wire.len());
    assert_eq!(
        decoded,
        vec![(10, b"first".to_vec()), (20, b"second".to_vec())]
    );
}

#[test]
fn test_split_header_and_body_dispatch_only_after_completion() {
    let codec = FrameCodec::new(4096);
    let frame = Frame::new(3, Bytes::from_static(b"late body"));
    let wire = wire_bytes(&codec, std::slice::from_ref(&frame));

    let mut buf = PooledBuffer::with_capacity(256);

    // first receive carries the 12 byte header only
    let space = buf.open(FRAME_HEADER_SIZE).unwrap();
    space.copy_from_slice(&wire[..FRAME_HEADER_SIZE]);
    buf.commit(FRAME_HEADER_SIZE).unwrap();
    assert!(codec.decode(buf.unread_bytes()).unwrap().is_none());

    // second receive completes the frame
    let rest = &wire[FRAME_HEADER_SIZE..];
    let space = buf.open(rest.len()).unwrap();
    space.copy_from_slice(rest);
    buf.commit(rest.len()).unwrap();

    let (view, consumed) = codec.decode(buf.unread_bytes()).unwrap().unwrap();
    assert_eq!(view.message_id, 3);
    assert_eq!(view.body, b"late body");
    assert_eq!(consumed, wire.len());
}

#[test]
fn test_max_sized_frame_round_trips() {
    let codec = FrameCodec::new(512);
    let frame = Frame::new(1, Bytes::from(vec![0xAB; 512 - FRAME_HEADER_SIZE]));
    let wire = wire_bytes(&codec, std::slice::from_ref(&frame));
    assert_eq!(wire.len(), 512);

    let decoded = decode_chunked(&codec, &wire, 7);
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].1.len(), 512 - FRAME_HEADER_SIZE);
}
