/*
 * Licensed to the Apache Software Foundation (ASF) under one or more
 * contributor license agreements.  See the NOTICE file distributed with
 * this work for additional information regarding copyright ownership.
 * The ASF licenses this file to You under the Apache License, Version 2.0
 * (the "License"); you may not use this file except in compliance with
 * the License.  You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{collections::HashMap, sync::Arc, time::Duration};

use crane::{
    codec::BinaryCodec, method, Client, CodecRegistry, CodecType, MethodHandler, Options, RpcError,
    Server, Service,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

struct Arith;

impl Service for Arith {
    fn name(&self) -> &'static str {
        "Arith"
    }

    fn methods(&self) -> HashMap<&'static str, MethodHandler> {
        let mut methods = HashMap::new();
        methods.insert("Add", method(|(a, b): (i32, i32)| async move { Ok(a + b) }));
        methods.insert(
            "Div",
            method(|(a, b): (i32, i32)| async move {
                if b == 0 {
                    return Err(RpcError::Service("division by zero".to_string()));
                }
                Ok(a / b)
            }),
        );
        methods.insert(
            "Sleep",
            method(|ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            }),
        );
        methods.insert(
            "Len",
            method(|data: Vec<u8>| async move { Ok(data.len() as u64) }),
        );
        methods
    }
}

struct Empty;

impl Service for Empty {
    fn name(&self) -> &'static str {
        "Empty"
    }

    fn methods(&self) -> HashMap<&'static str, MethodHandler> {
        HashMap::new()
    }
}

async fn start_server() -> String {
    let server = Arc::new(Server::default());
    server.register(Arith).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.accept(listener).await });
    addr
}

#[tokio::test]
async fn test_add_roundtrip_on_both_codecs() {
    let addr = start_server().await;
    for codec_type in [CodecType::Binary, CodecType::Json] {
        let client = Client::dial(&addr, Options::with_codec(codec_type))
            .await
            .unwrap();
        let sum: i32 = client.call("Arith.Add", &(100i32, 200i32)).await.unwrap();
        assert_eq!(sum, 300);
        client.close().await;
    }
}

#[tokio::test]
async fn test_application_error_keeps_connection_open() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Div", &(10i32, 0i32))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Service(_)));
    assert!(err.to_string().contains("division by zero"));

    assert!(client.is_available());
    let quotient: i32 = client.call("Arith.Div", &(10i32, 2i32)).await.unwrap();
    assert_eq!(quotient, 5);
}

#[tokio::test]
async fn test_unknown_method_is_not_fatal() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Mul", &(2i32, 3i32))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find service/method"));

    let sum: i32 = client.call("Arith.Add", &(1i32, 2i32)).await.unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_talk() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..32i32 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let sum: i32 = client.call("Arith.Add", &(i, i)).await.unwrap();
            assert_eq!(sum, i * 2);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_go_resolves_asynchronously() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let call = client.go::<_, i32>("Arith.Add", &(20i32, 22i32));
    assert_eq!(call.service_method, "Arith.Add");
    assert_eq!(call.done().await.unwrap(), 42);
}

#[tokio::test]
async fn test_close_fails_every_pending_call() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let mut calls = Vec::new();
    for _ in 0..8 {
        calls.push(client.go::<_, u64>("Arith.Sleep", &500u64));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;
    assert!(!client.is_available());

    for call in calls {
        let err = call.done().await.unwrap_err();
        assert!(matches!(err, RpcError::Shutdown | RpcError::ConnectionLost(_)));
    }

    // further calls are refused outright
    let err = client
        .call::<_, i32>("Arith.Add", &(1i32, 1i32))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown));
}

#[tokio::test]
async fn test_handle_timeout_without_late_second_response() {
    let addr = start_server().await;
    let mut opt = Options::default();
    opt.handle_timeout = Duration::from_millis(100);
    let client = Client::dial(&addr, opt).await.unwrap();

    let err = client.call::<_, u64>("Arith.Sleep", &400u64).await.unwrap_err();
    assert!(err.to_string().contains("handle timeout"));

    // the handler finishes ~300ms later; its discarded result must not
    // desynchronize the stream for the next call
    tokio::time::sleep(Duration::from_millis(400)).await;
    let sum: i32 = client.call("Arith.Add", &(100i32, 200i32)).await.unwrap();
    assert_eq!(sum, 300);
}

#[tokio::test]
async fn test_caller_deadline_discards_late_response() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let slow = tokio::time::timeout(
        Duration::from_millis(50),
        client.call::<_, u64>("Arith.Sleep", &300u64),
    )
    .await;
    assert!(slow.is_err());

    // the abandoned call's response arrives later and is dropped by the
    // receive loop; the connection keeps working
    tokio::time::sleep(Duration::from_millis(350)).await;
    let sum: i32 = client.call("Arith.Add", &(3i32, 4i32)).await.unwrap();
    assert_eq!(sum, 7);
}

#[tokio::test]
async fn test_cancelled_large_send_keeps_stream_in_sync() {
    let addr = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    // a frame big enough that the socket backpressures the write; the
    // deadline fires while the frame is still in flight
    let payload = vec![7u8; 6 * 1024 * 1024];
    let cancelled = tokio::time::timeout(
        Duration::from_millis(1),
        client.call::<_, u64>("Arith.Len", &payload),
    )
    .await;
    assert!(cancelled.is_err());

    // the abandoned frame still reaches the wire whole, so the connection
    // must stay usable instead of hanging on a truncated frame
    let sum: i32 = tokio::time::timeout(
        Duration::from_secs(5),
        client.call("Arith.Add", &(1i32, 2i32)),
    )
    .await
    .expect("connection desynchronized by a cancelled send")
    .unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_http_connect_upgrade() {
    let server = Arc::new(Server::default());
    server.register(Arith).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.serve_http(listener).await });

    let client = Client::dial_http(&addr, Options::default()).await.unwrap();
    let sum: i32 = client.call("Arith.Add", &(7i32, 8i32)).await.unwrap();
    assert_eq!(sum, 15);

    let via_scheme = Client::dial_addr(&format!("http@{addr}"), Options::default())
        .await
        .unwrap();
    let sum: i32 = via_scheme.call("Arith.Add", &(1i32, 1i32)).await.unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_server_rejects_bad_magic() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"{\"magic\":1,\"codec_type\":\"binary\"}\n")
        .await
        .unwrap();

    // server drops the connection without any codec traffic
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_server_rejects_unregistered_codec() {
    let codecs = CodecRegistry::empty();
    codecs.set_codec(CodecType::Binary, BinaryCodec::new).unwrap();
    let server = Arc::new(Server::new(codecs));
    server.register(Arith).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.accept(listener).await });

    // valid magic, but a codec this server does not carry
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"{\"magic\":3927900,\"codec_type\":\"json\"}\n")
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_dial_requires_a_registered_codec() {
    let addr = start_server().await;
    let err = Client::dial_with(&addr, Options::default(), &CodecRegistry::empty())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unregistered codec type"));
}

#[tokio::test]
async fn test_register_rejects_empty_and_duplicate_services() {
    let server = Server::default();
    assert!(matches!(
        server.register(Empty).unwrap_err(),
        RpcError::NoMethods(_)
    ));
    server.register(Arith).unwrap();
    assert!(matches!(
        server.register(Arith).unwrap_err(),
        RpcError::DuplicateService(_)
    ));
}

#[tokio::test]
async fn test_failed_duplicate_registration_leaves_the_service_intact() {
    let server = Arc::new(Server::default());
    server.register(Arith).unwrap();
    assert!(server.register(Arith).is_err());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.accept(listener).await });

    let client = Client::dial(&addr, Options::default()).await.unwrap();
    let sum: i32 = client.call("Arith.Add", &(100i32, 200i32)).await.unwrap();
    assert_eq!(sum, 300);
}

#[tokio::test]
async fn test_client_rejects_unknown_codec_scheme() {
    let err = Client::dial_addr("quic@127.0.0.1:1", Options::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
}
