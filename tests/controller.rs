//! End-to-end scenarios driving `Controller` over a real TCP connection
//! against an in-process mock control-port server, the way a live Tor
//! instance would speak to it.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tor_control::Controller;

/// Reads until a `\r\n`-terminated line is complete. `Session::command`
/// writes a line's bytes and its terminator as separate `write_all` calls, so
/// a single `read()` is not guaranteed to land on a command boundary.
async fn read_command(stream: &mut TcpStream) -> String {
    let mut acc = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        acc.push(byte[0]);
        if acc.ends_with(b"\r\n") {
            return String::from_utf8_lossy(&acc).into_owned();
        }
    }
}

#[tokio::test]
async fn null_auth_connect_and_getinfo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("PROTOCOLINFO 1"));
        stream
            .write_all(b"250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.7.1\"\r\n250 OK\r\n")
            .await
            .unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("AUTHENTICATE"));
        stream.write_all(b"250 OK\r\n").await.unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("GETINFO version"));
        stream.write_all(b"250-version=0.4.7.1\r\n250 OK\r\n").await.unwrap();
        stream
    });

    let controller = Controller::connect("127.0.0.1", port).await.unwrap();
    controller.authenticate(None).await.unwrap();
    let version = controller.get_info("version").await.unwrap();
    assert_eq!(version, "0.4.7.1");

    server.await.unwrap();
}

#[tokio::test]
async fn safecookie_auth_rejects_tampered_server_hash() {
    let cookie_path = std::env::temp_dir().join(format!("tor_control_test_cookie_{:?}", std::thread::current().id()));
    tokio::fs::write(&cookie_path, [0u8; 32]).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cookie_path_str = cookie_path.to_str().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = read_command(&mut stream).await;
        stream
            .write_all(
                format!(
                    "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=SAFECOOKIE COOKIEFILE=\"{}\"\r\n250 OK\r\n",
                    cookie_path_str
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("AUTHCHALLENGE SAFECOOKIE"));
        // A server hash that cannot possibly verify against any client nonce.
        stream
            .write_all(b"250 AUTHCHALLENGE SERVERHASH=00000000000000000000000000000000000000000000000000000000000000 SERVERNONCE=11111111111111111111111111111111111111111111111111111111111111\r\n")
            .await
            .unwrap();
        stream
    });

    let controller = Controller::connect("127.0.0.1", port).await.unwrap();
    let result = controller.authenticate(None).await;
    assert!(result.is_err());

    server.await.unwrap();
    let _ = tokio::fs::remove_file(&cookie_path).await;
}

#[tokio::test]
async fn add_onion_waits_for_hs_desc_upload_before_returning() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let _ = read_command(&mut stream).await;
        stream.write_all(b"250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250 OK\r\n").await.unwrap();

        let _ = read_command(&mut stream).await;
        stream.write_all(b"250 OK\r\n").await.unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("SETEVENTS HS_DESC"));
        stream.write_all(b"250 OK\r\n").await.unwrap();

        let req = read_command(&mut stream).await;
        assert!(req.contains("ADD_ONION NEW:BEST"));
        // The server answers ADD_ONION first, then, after a short delay,
        // fires the HS_DESC UPLOADED event — add_onion must wait for it.
        stream
            .write_all(b"250-ServiceID=abcdefghijklmnop234567890123456789012345678901234567890\r\n250 OK\r\n")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream
            .write_all(b"650 HS_DESC UPLOADED abcdefghijklmnop234567890123456789012345678901234567890 NO_AUTH somedir\r\n")
            .await
            .unwrap();

        stream
    });

    let controller = Controller::connect("127.0.0.1", port).await.unwrap();
    controller.authenticate(None).await.unwrap();

    let mut onion = tor_control::Onion::new();
    controller.add_onion(&mut onion, true).await.unwrap();

    let id = onion.id.clone().unwrap();
    assert!(controller.is_onion_live(&id).await);

    server.await.unwrap();
}

#[tokio::test]
async fn protocolinfo_failure_surfaces_connect_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_command(&mut stream).await;
        stream.write_all(b"510 Unrecognized command\r\n").await.unwrap();
        stream
    });

    let result = Controller::connect("127.0.0.1", port).await;
    assert!(result.is_err());

    server.await.unwrap();
}
