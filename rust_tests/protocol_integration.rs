//! Integration tests for the wire protocol: whatever a worker
//! writes, the coordinator decodes byte-for-byte identical, however
//! the bytes are sliced.

use assay::protocol::{
    encode_frame, Command, FailKind, Failure, Frame, FrameDecoder, ImportEvent, Response,
};
use std::path::PathBuf;

fn rich_failure() -> Failure {
    Failure {
        kind: FailKind::Assertion,
        name: "AssertionError".to_string(),
        message: "BUT 2\n   != 3".to_string(),
        frames: vec![
            Frame {
                path: "/project/pkg/helpers.py".to_string(),
                line: 40,
                function: "check_totals".to_string(),
                source: "assert total == expected".to_string(),
            },
            Frame {
                path: "/project/pkg/tests.py".to_string(),
                line: 12,
                function: "test_totals(3)".to_string(),
                source: "check_totals(n)".to_string(),
            },
        ],
        stdout: "computing…\n".to_string(),
        stderr: "warning: legacy mode\n".to_string(),
    }
}

fn roundtrip(response: &Response) -> Response {
    let frame = encode_frame(response).unwrap();
    let mut decoder = FrameDecoder::new();
    decoder.feed(&frame);
    let decoded = decoder.next_response().unwrap().unwrap();
    assert!(decoder.is_empty(), "bytes left after {response:?}");
    decoded
}

#[test]
fn every_record_variant_survives_a_roundtrip() {
    let records = vec![
        Response::Forked(4242),
        Response::Preloaded {
            events: vec![
                ImportEvent::new("pkg.tests", &["pkg", "pkg.helpers", "pkg.tests"]),
                ImportEvent::new("pkg.missing", &[]),
            ],
            paths: vec![("pkg".to_string(), PathBuf::from("/project/pkg/__init__.py"))],
        },
        Response::Pass,
        Response::PassNamed("test_totals(3)".to_string()),
        Response::Fail(rich_failure()),
        Response::Paths(vec![(
            "pkg.tests".to_string(),
            PathBuf::from("/project/pkg/tests.py"),
        )]),
        Response::EndOfStream,
    ];
    for record in &records {
        assert_eq!(&roundtrip(record), record);
    }
}

#[test]
fn commands_roundtrip_too() {
    let commands = vec![
        Command::Preload(vec!["a".to_string(), "b.c".to_string()]),
        Command::Fork,
        Command::RunTests {
            module: "pkg.tests".to_string(),
            verbose: true,
        },
    ];
    for command in &commands {
        let frame = encode_frame(command).unwrap();
        let decoded: Command = bincode::deserialize(&frame[4..]).unwrap();
        assert_eq!(&decoded, command);
    }
}

#[test]
fn byte_at_a_time_delivery_decodes_identically() {
    let original = Response::Fail(rich_failure());
    let frame = encode_frame(&original).unwrap();
    let mut decoder = FrameDecoder::new();
    let mut decoded = None;
    for byte in &frame {
        decoder.feed(std::slice::from_ref(byte));
        if let Some(record) = decoder.next_response().unwrap() {
            decoded = Some(record);
        }
    }
    assert_eq!(decoded.unwrap(), original);
}

#[test]
fn torn_record_discard_leaves_next_stream_clean() {
    // a record cut off mid-frame, as a SIGKILLed child leaves it
    let torn = encode_frame(&Response::Fail(rich_failure())).unwrap();
    let mut decoder = FrameDecoder::new();
    decoder.feed(&torn[..torn.len() - 7]);
    assert!(decoder.next_response().unwrap().is_none());

    // the resync protocol drops the partial bytes…
    decoder.clear();

    // …so the next dispatch's stream decodes from its first byte
    let mut stream = encode_frame(&Response::Pass).unwrap();
    stream.extend(encode_frame(&Response::EndOfStream).unwrap());
    decoder.feed(&stream);
    assert_eq!(decoder.next_response().unwrap(), Some(Response::Pass));
    assert_eq!(
        decoder.next_response().unwrap(),
        Some(Response::EndOfStream)
    );
    assert!(decoder.is_empty());
}

#[test]
fn interleaved_short_reads_across_two_records() {
    let mut bytes = encode_frame(&Response::PassNamed("test_a".to_string())).unwrap();
    bytes.extend(encode_frame(&Response::Pass).unwrap());
    let mut decoder = FrameDecoder::new();
    let mut seen = Vec::new();
    for chunk in bytes.chunks(3) {
        decoder.feed(chunk);
        while let Some(record) = decoder.next_response().unwrap() {
            seen.push(record);
        }
    }
    assert_eq!(
        seen,
        vec![
            Response::PassNamed("test_a".to_string()),
            Response::Pass,
        ]
    );
}
