mod listener_test {
    use std::{convert::Infallible, net::SocketAddr, time::Duration};

    use abtest_edge::{EdgeBuilder, FixedSource, Group};
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::{
        body::{Bytes, Incoming},
        header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
        server::conn::http1,
        service::service_fn,
        HeaderMap, Request, Response, StatusCode, Uri,
    };
    use hyper_util::{
        client::legacy::{connect::HttpConnector, Client},
        rt::{TokioExecutor, TokioIo},
    };
    use tokio::net::TcpListener;

    #[test]
    fn test_edge_listener() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|e| panic!("Failed to create test runtime: {:?}", e));

        runtime.block_on(async {
            let origin = spawn_origin().await;

            let local = [127, 0, 0, 1];
            let port = get_available_port(local).await;
            let socket_address = SocketAddr::from((local, port));

            let (_router, server) = EdgeBuilder::new()
                .with_http_listener(socket_address)
                .with_upstream(format!("http://{origin}"))
                .and_then(|builder| builder.add_allowed_address("127.0.0.1"))
                .map(|builder| builder.with_group_source(FixedSource(Group::Variant)))
                .and_then(EdgeBuilder::build)
                .unwrap_or_else(|e| panic!("failed to create edge listener: {:?}", e));

            spawn_server(server);
            tokio::time::sleep(Duration::from_millis(200)).await;

            let base = format!("http://{socket_address}");

            // First visit: assigned, counted, served the variant page.
            let (status, headers, body) = read_from(&base, "/abtest?from=ad", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "origin saw /abtest/variant?from=ad");
            assert_eq!(
                set_cookies(&headers),
                ["cloudflare_ab_test=variant; Path=/; Max-Age=31536000"]
            );

            // Returning visit: same page, nothing new.
            let assigned = "cloudflare_ab_test=variant";
            let (status, headers, body) = read_from(&base, "/abtest", Some(assigned)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "origin saw /abtest/variant");
            assert!(set_cookies(&headers).is_empty());

            // Action, then the same action again with the dedup cookie.
            let (status, headers, _) = read_from(&base, "/abtest/action", Some(assigned)).await;
            assert_eq!(status, StatusCode::FOUND);
            assert_eq!(headers.get(LOCATION).unwrap(), "/");
            assert_eq!(
                set_cookies(&headers),
                ["cloudflare_ab_test_counted=true; Path=/; Max-Age=31536000"]
            );

            let counted = "cloudflare_ab_test=variant; cloudflare_ab_test_counted=true";
            let (status, headers, _) = read_from(&base, "/abtest/action", Some(counted)).await;
            assert_eq!(status, StatusCode::FOUND);
            assert!(set_cookies(&headers).is_empty());

            // Everything else goes straight through.
            let (status, _, body) = read_from(&base, "/static/app.js", Some(counted)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "origin saw /static/app.js");

            let (status, headers, body) = read_from(&base, "/abtest/result", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
            assert_eq!(
                body,
                r#"{"controlShow":0,"controlAction":0,"variantShow":1,"variantAction":1}"#
            );
        });
    }

    #[test]
    fn test_unreachable_origin() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|e| panic!("Failed to create test runtime: {:?}", e));

        runtime.block_on(async {
            let local = [127, 0, 0, 1];
            let origin_port = get_available_port(local).await;
            let port = get_available_port(local).await;
            let socket_address = SocketAddr::from((local, port));

            let (router, server) = EdgeBuilder::new()
                .with_http_listener(socket_address)
                .with_upstream(format!("http://127.0.0.1:{origin_port}"))
                .and_then(EdgeBuilder::build)
                .unwrap_or_else(|e| panic!("failed to create edge listener: {:?}", e));

            spawn_server(server);
            tokio::time::sleep(Duration::from_millis(200)).await;

            let base = format!("http://{socket_address}");
            let (status, headers, _) = read_from(&base, "/abtest", None).await;
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert_eq!(set_cookies(&headers).len(), 1);

            let results = router.experiment().results().await.unwrap();
            assert_eq!(results.control_show + results.variant_show, 1);
        });
    }

    fn spawn_server(server: abtest_edge::ServerFuture) {
        tokio::spawn(async move {
            if let Err(e) = server.await {
                panic!("edge server stopped: {:?}", e);
            }
        });
    }

    async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap_or_else(|e| panic!("Unable to bind origin listener: {:?}", e));
        let address = listener.local_addr().expect("Unable to obtain origin address");

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let service = service_fn(|req: Request<Incoming>| async move {
                    let seen = format!("origin saw {}", req.uri());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(seen))))
                });
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        address
    }

    async fn get_available_port(listen_address: [u8; 4]) -> u16 {
        let socket_address = SocketAddr::from((listen_address, 0));
        TcpListener::bind(socket_address)
            .await
            .unwrap_or_else(|e| {
                panic!("Unable to bind to an available port on address {socket_address}: {:?}", e);
            })
            .local_addr()
            .expect("Unable to obtain local address from TcpListener")
            .port()
    }

    fn set_cookies(headers: &HeaderMap) -> Vec<String> {
        headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect()
    }

    async fn read_from(
        base: &str,
        path: &str,
        cookie: Option<&str>,
    ) -> (StatusCode, HeaderMap, String) {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let endpoint = format!("{base}{path}")
            .parse::<Uri>()
            .unwrap_or_else(|e| panic!("Error parsing URI: {:?}", e));
        let req = Request::builder().uri(endpoint.clone());
        let req = if let Some(cookie) = cookie { req.header(COOKIE, cookie) } else { req };
        let req = req
            .body(Empty::<Bytes>::new())
            .unwrap_or_else(|e| panic!("Failed building request: {:?}", e));

        let response = client
            .request(req)
            .await
            .unwrap_or_else(|e| panic!("Failed requesting data from {endpoint}: {:?}", e));

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .unwrap_or_else(|e| panic!("Error reading response: {:?}", e))
            .to_bytes();

        (parts.status, parts.headers, String::from_utf8_lossy(&body).into_owned())
    }
}
