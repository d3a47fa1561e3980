use crate::backend::memory::InMemoryBackend;
use crate::backend::{AuthenticatedUser, Decision, SlidingWindowBackend};
use crate::middleware::*;
use crate::policy::{EndpointOverride, Policy, RateLimitConfig, Whitelist};
use crate::presets;
use actix_web::dev::Service as _;
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::test::{read_body, read_body_json, TestRequest};
use actix_web::{get, test, App, HttpMessage, HttpResponse, Responder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[get("/200")]
async fn route_200() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

#[get("/500")]
async fn route_500() -> impl Responder {
    HttpResponse::InternalServerError().body("Internal error")
}

#[get("/auth/login")]
async fn route_login() -> impl Responder {
    HttpResponse::Ok().body("Welcome")
}

#[get("/other")]
async fn route_other() -> impl Responder {
    HttpResponse::Ok().body("Other")
}

#[derive(Clone, Default)]
struct MockBackend(Arc<MockBackendInner>);

#[derive(Default)]
struct MockBackendInner {
    counter: AtomicU64,
}

struct MockBackendInput<T> {
    max: u64,
    output: T,
    backend_error: Option<actix_web::Error>,
}

impl<T: 'static> Backend<MockBackendInput<T>> for MockBackend {
    type Output = T;
    type RollbackToken = ();
    type Error = actix_web::Error;

    async fn request(
        &self,
        input: MockBackendInput<T>,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        if let Some(e) = input.backend_error {
            return Err(e);
        }
        let allow = self.0.counter.fetch_add(1, Ordering::Relaxed) < input.max;
        Ok((Decision::from_allowed(allow), input.output, ()))
    }

    async fn rollback(&self, _token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.0.counter.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

fn peer(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), 40000)
}

fn get_from(uri: &str, ip: &str) -> TestRequest {
    TestRequest::get().uri(uri).peer_addr(peer(ip))
}

#[actix_web::test]
async fn test_allow_deny() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend, |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: 1,
            output: (),
            backend_error: None,
        }))
    })
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    assert!(
        test::call_service(&app, TestRequest::get().uri("/200").to_request())
            .await
            .status()
            .is_success()
    );
    assert_eq!(
        test::call_service(&app, TestRequest::get().uri("/200").to_request())
            .await
            .status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[actix_web::test]
async fn test_exempt_skips_backend() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend.clone(), |_req| async {
        Ok(Admission::<MockBackendInput<()>>::Exempt(
            crate::backend::Exemption::Whitelisted,
        ))
    })
    .request_allowed_transformation(Some(|map: &mut HeaderMap, _: Option<&()>| {
        map.insert(
            HeaderName::from_static("custom-header"),
            HeaderValue::from_static(""),
        );
    }))
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    for _ in 0..3 {
        let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("custom-header"));
    }
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 0);
}

#[actix_web::test]
async fn test_custom_deny_response() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend, |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: 0,
            output: StatusCode::IM_A_TEAPOT,
            backend_error: None,
        }))
    })
    .request_denied_response(|output| HttpResponse::build(*output).body("Custom denied response"))
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
    assert_eq!(body, "Custom denied response");
}

#[actix_web::test]
async fn test_header_transformation() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend, |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: u64::MAX,
            output: "abc".to_string(),
            backend_error: None,
        }))
    })
    .request_allowed_transformation(Some(|headers: &mut HeaderMap, output: Option<&String>| {
        assert!(
            output.is_some(),
            "Backend is working so output should be some"
        );
        headers.insert(
            HeaderName::from_static("test-header"),
            HeaderValue::from_str(output.unwrap()).unwrap(),
        );
    }))
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("test-header")
            .unwrap()
            .to_str()
            .unwrap(),
        "abc"
    );
}

#[actix_web::test]
async fn test_fail_open() {
    let backend = MockBackend::default();

    // Test first without fail open
    let limiter = RateLimiter::builder(backend.clone(), |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: u64::MAX,
            output: (),
            backend_error: Some(actix_web::error::ErrorInternalServerError("Mock Error")),
        }))
    })
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Test again with fail open enabled
    let limiter = RateLimiter::builder(backend, |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: u64::MAX,
            output: (),
            backend_error: Some(actix_web::error::ErrorInternalServerError("Mock Error")),
        }))
    })
    .request_allowed_transformation(Some(|map: &mut HeaderMap, output: Option<&()>| {
        map.insert(
            HeaderName::from_static("custom-header"),
            HeaderValue::from_static(""),
        );
        assert!(output.is_none());
    }))
    .fail_open(true)
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("custom-header"))
}

#[actix_web::test]
async fn test_input_error() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend.clone(), |_req| async {
        Err::<Admission<MockBackendInput<()>>, _>(actix_web::error::ErrorBadRequest("bad input"))
    })
    .build();
    let app = test::init_service(App::new().service(route_200).wrap(limiter)).await;
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 0);
}

#[actix_web::test]
async fn test_rollback() {
    let backend = MockBackend::default();
    let limiter = RateLimiter::builder(backend.clone(), |_req| async {
        Ok(Admission::Evaluate(MockBackendInput {
            max: u64::MAX,
            output: (),
            backend_error: None,
        }))
    })
    .rollback_server_errors()
    .build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(limiter),
    )
    .await;

    // Confirm count increases for a 200 response
    let response = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 1);

    // Confirm count hasn't increased
    let response = test::call_service(&app, TestRequest::get().uri("/500").to_request()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(backend.0.counter.load(Ordering::Relaxed), 1);
}

#[actix_web::test]
async fn test_in_memory_rollback() {
    tokio::time::pause();
    let backend = InMemoryBackend::builder().build();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)));
    let limiter = RateLimiter::builder(
        backend.clone(),
        crate::backend::InputFunctionBuilder::new(config).build(),
    )
    .rollback_server_errors()
    .build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(limiter),
    )
    .await;
    // Server errors don't use up the quota
    for _ in 0..3 {
        let response = test::call_service(&app, get_from("/500", "10.0.0.1").to_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(backend.remaining("ip:10.0.0.1", 1, MINUTE).await.unwrap(), 1);
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_limit_then_deny_with_body() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(2, MINUTE)));
    let backend = InMemoryBackend::builder().with_config(&config).build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;

    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(response.headers().get("x-ratelimit-window").unwrap(), "1m");
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "1");

    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let body: serde_json::Value = read_body_json(response).await;
    assert_eq!(
        body,
        serde_json::json!({"error": "rate limit exceeded", "retry_after": 60})
    );
}

#[actix_web::test]
async fn test_burst_ceiling() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE).with_burst(1)));
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;
    for _ in 0..2 {
        let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_retry_after_window() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)));
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    tokio::time::advance(MINUTE + Duration::from_secs(1)).await;
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_endpoint_override() {
    tokio::time::pause();
    let config = Arc::new(
        RateLimitConfig::new(Policy::new(10, MINUTE))
            .endpoint(EndpointOverride::new("/auth/login", Policy::new(1, MINUTE))),
    );
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_login)
            .service(route_other)
            .wrap(presets::global(backend, config)),
    )
    .await;
    let response = test::call_service(&app, get_from("/auth/login", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1");
    let response = test::call_service(&app, get_from("/other", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "10");
    let response = test::call_service(&app, get_from("/auth/login", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let response = test::call_service(&app, get_from("/other", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_endpoint_override_above_exhausted_global() {
    tokio::time::pause();
    let config = Arc::new(
        RateLimitConfig::new(Policy::new(1, MINUTE))
            .endpoint(EndpointOverride::new("/auth/login", Policy::new(3, MINUTE))),
    );
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_login)
            .service(route_other)
            .wrap(presets::global(backend, config)),
    )
    .await;
    let response = test::call_service(&app, get_from("/other", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(&app, get_from("/other", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    for _ in 0..3 {
        let response =
            test::call_service(&app, get_from("/auth/login", "10.0.0.1").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[actix_web::test]
async fn test_whitelist() {
    tokio::time::pause();
    let config = Arc::new(
        RateLimitConfig::new(Policy::new(0, MINUTE))
            .whitelist(Whitelist::parse(["192.168.1.0/24"]).unwrap()),
    );
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;
    for _ in 0..20 {
        let response =
            test::call_service(&app, get_from("/200", "192.168.1.100").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_disabled() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(0, MINUTE)).enabled(false));
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;
    for _ in 0..5 {
        let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[actix_web::test]
async fn test_forwarded_client_ip() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)));
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::global(backend, config)),
    )
    .await;
    // Two clients behind the same proxy are counted apart
    for client in ["203.0.113.1", "203.0.113.2"] {
        let req = TestRequest::get()
            .uri("/200")
            .insert_header(("X-Forwarded-For", client))
            .peer_addr(peer("10.0.0.254"))
            .to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let req = TestRequest::get()
        .uri("/200")
        .insert_header(("X-Forwarded-For", "203.0.113.1"))
        .peer_addr(peer("10.0.0.254"))
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

fn user_request(uri: &str, ip: &str, user: Option<&str>) -> TestRequest {
    let req = get_from(uri, ip);
    match user {
        Some(user) => req.insert_header(("x-test-user", user)),
        None => req,
    }
}

macro_rules! app_with_auth {
    ($limiter:expr) => {
        test::init_service(
            App::new()
                .service(route_200)
                .service(route_login)
                .wrap($limiter)
                .wrap_fn(|req, srv| {
                    let user = req
                        .headers()
                        .get("x-test-user")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    if let Some(user) = user {
                        req.extensions_mut().insert(AuthenticatedUser(user));
                    }
                    srv.call(req)
                }),
        )
        .await
    };
}

#[actix_web::test]
async fn test_user_based_partitions() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(5, MINUTE)).user_based(true));
    let backend = InMemoryBackend::builder().build();
    let app = app_with_auth!(presets::global(backend, config));
    for user in ["alice", "bob"] {
        for _ in 0..5 {
            let response = test::call_service(
                &app,
                user_request("/200", "10.0.0.1", Some(user)).to_request(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
    for user in ["alice", "bob"] {
        let response = test::call_service(
            &app,
            user_request("/200", "10.0.0.1", Some(user)).to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    // The shared IP itself still has its own quota
    let response =
        test::call_service(&app, user_request("/200", "10.0.0.1", None).to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_ip_only_ignores_user() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)).user_based(true));
    let backend = InMemoryBackend::builder().build();
    let app = app_with_auth!(presets::ip_only(backend, config));
    let response = test::call_service(
        &app,
        user_request("/auth/login", "10.0.0.1", Some("alice")).to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(
        &app,
        user_request("/auth/login", "10.0.0.1", Some("bob")).to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_user_only_lets_anonymous_through() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)));
    let backend = InMemoryBackend::builder().build();
    let app = app_with_auth!(presets::user_only(backend.clone(), config));
    for _ in 0..3 {
        let response =
            test::call_service(&app, user_request("/200", "10.0.0.1", None).to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
    let response = test::call_service(
        &app,
        user_request("/200", "10.0.0.1", Some("alice")).to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        backend.remaining("user_only:user:alice", 1, MINUTE).await.unwrap(),
        0
    );
    let response = test::call_service(
        &app,
        user_request("/200", "10.0.0.1", Some("alice")).to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_presets_share_a_backend() {
    tokio::time::pause();
    let config = Arc::new(RateLimitConfig::new(Policy::new(1, MINUTE)));
    let backend = InMemoryBackend::builder().build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .wrap(presets::ip_only(backend.clone(), config.clone()))
            .wrap(presets::global(backend, config)),
    )
    .await;
    // Each limiter counts the request once under its own key
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = test::call_service(&app, get_from("/200", "10.0.0.1").to_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
