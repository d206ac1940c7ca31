use async_trait::async_trait;
use esi_interpreter::{
    adapter, Configuration, ExecutionError, Fetcher, FunctionRegistry, Processor, Result, Value,
    Variables,
};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Notify;

static INIT: Once = Once::new();

pub fn init_logs() {
    INIT.call_once(|| {
        // Read RUST_LOG if set; otherwise default to quiet globally, debug for *this* crate.
        let default = format!("warn,{}=debug", env!("CARGO_CRATE_NAME"));
        env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", &default))
            .is_test(true) // shows logs without --nocapture
            .init();

        log::debug!("debug is enabled)");
    });
}

#[derive(Clone)]
struct Route {
    body: String,
    status: u16,
    delay: Duration,
}

// Serves canned responses and records every requested URL.
#[derive(Clone, Default)]
struct MockFetcher {
    routes: HashMap<String, Route>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn route(self, url: &str, body: &str) -> Self {
        self.delayed(url, body, Duration::ZERO)
    }

    fn delayed(mut self, url: &str, body: &str, delay: Duration) -> Self {
        self.routes.insert(
            url.to_string(),
            Route {
                body: body.to_string(),
                status: 200,
                delay,
            },
        );
        self
    }

    fn failing(mut self, url: &str, status: u16) -> Self {
        self.routes.insert(
            url.to_string(),
            Route {
                body: String::new(),
                status,
                delay: Duration::ZERO,
            },
        );
        self
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.requests.lock().unwrap().push(url.to_string());
        let Some(route) = self.routes.get(url) else {
            return Err(ExecutionError::UnexpectedStatus(url.to_string(), 404));
        };
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        if route.status >= 400 {
            return Err(ExecutionError::UnexpectedStatus(url.to_string(), route.status));
        }
        Ok(route.body.clone())
    }
}

// Responds with the requested URL itself.
struct EchoFetcher;

#[async_trait]
impl Fetcher for EchoFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        Ok(url.to_string())
    }
}

// `/first` only completes once `/second` has been requested, so a document
// including both in that order can only finish if the fetches overlap.
#[derive(Default)]
struct RendezvousFetcher {
    second_requested: Arc<Notify>,
}

#[async_trait]
impl Fetcher for RendezvousFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        if url == "/first" {
            self.second_requested.notified().await;
        } else {
            self.second_requested.notify_one();
        }
        Ok(url.trim_start_matches('/').to_string())
    }
}

fn processor(fetcher: impl Fetcher + 'static) -> Processor {
    Processor::new(fetcher, Configuration::default())
}

// Helper function to process an ESI document with the given variables
async fn process_esi_document(
    input: &str,
    fetcher: impl Fetcher + 'static,
    variables: Variables,
) -> Result<String> {
    debug!("Processing ESI document: {:?}", input);
    let result = processor(fetcher)
        .process_document_with(input, variables)
        .await;
    debug!("Processed result: {:?}", result);
    result
}

fn query_string(params: &[(&str, &str)]) -> Variables {
    let params: HashMap<String, Value> = params
        .iter()
        .map(|(key, value)| (key.to_string(), Value::from(*value)))
        .collect();
    Variables::from([("QUERY_STRING".to_string(), Value::from(params))])
}

#[tokio::test]
async fn test_document_without_tags_is_unchanged() -> Result<()> {
    init_logs();
    let input = "<html><body><p>Costs $5 &amp; more</p></body></html>";
    let result = processor(MockFetcher::new()).process_document(input).await?;
    assert_eq!(result, input);
    Ok(())
}

#[tokio::test]
async fn test_include() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("http://example.com/hello", "hello");
    let result = processor(fetcher)
        .process_document(r#"<esi:include src="http://example.com/hello"></esi:include>"#)
        .await?;
    assert_eq!(result, "hello");
    Ok(())
}

#[tokio::test]
async fn test_multiple_includes_with_extra_attributes() -> Result<()> {
    init_logs();
    let input = r#"<esi:include src="/text1" ignore/>, <esi:include src="/text2" ignore/>,<esi:include src="/text3"/>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, "/text1, /text2,/text3");
    Ok(())
}

#[tokio::test]
async fn test_includes_keep_document_order() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new()
        .delayed("/slow", "slow", Duration::from_millis(50))
        .route("/fast", "fast");
    let result = processor(fetcher)
        .process_document(r#"<esi:include src="/slow"/>|<esi:include src="/fast"/>"#)
        .await?;
    assert_eq!(result, "slow|fast");
    Ok(())
}

#[tokio::test]
async fn test_includes_are_fetched_concurrently() -> Result<()> {
    init_logs();
    let processor = processor(RendezvousFetcher::default());
    let processing =
        processor.process_document(r#"<esi:include src="/first"/> <esi:include src="/second"/>"#);
    let result = tokio::time::timeout(Duration::from_secs(5), processing)
        .await
        .expect("includes should not be fetched one after another")?;
    assert_eq!(result, "first second");
    Ok(())
}

#[tokio::test]
async fn test_failing_include_fails_document() {
    init_logs();
    let fetcher = MockFetcher::new().failing("/broken", 500);
    let result = processor(fetcher)
        .process_document(r#"before <esi:include src="/broken"/> after"#)
        .await;
    match result {
        Err(err @ ExecutionError::UnresolvedInclude { .. }) => {
            assert_eq!(err.url(), Some("/broken"));
            if let ExecutionError::UnresolvedInclude { source, .. } = err {
                assert!(matches!(*source, ExecutionError::UnexpectedStatus(_, 500)));
                assert_eq!(source.url(), Some("/broken"));
            }
        }
        other => panic!("expected an unresolved include, got {:?}", other),
    }
}

#[tokio::test]
async fn test_one_failing_branch_fails_whole_document() {
    init_logs();
    let fetcher = MockFetcher::new().route("/ok", "ok").failing("/broken", 503);
    let result = processor(fetcher)
        .process_document(r#"<esi:include src="/ok"/><esi:include src="/broken"/>"#)
        .await;
    assert!(matches!(
        result,
        Err(ExecutionError::UnresolvedInclude { ref url, .. }) if url == "/broken"
    ));
}

#[tokio::test]
async fn test_adapter_passes_document_through_on_error() -> Result<()> {
    init_logs();
    let input = r#"<p><esi:include src="/broken"/></p>"#;
    let fetcher = MockFetcher::new().failing("/broken", 500);

    let strict = processor(fetcher.clone());
    assert!(adapter::respond(&strict, input).await.is_err());

    let lenient = Processor::new(
        fetcher,
        Configuration::default().with_passthrough_on_error(true),
    );
    assert_eq!(adapter::respond(&lenient, input).await?, input);
    Ok(())
}

#[tokio::test]
async fn test_adapter_document_from_path() -> Result<()> {
    init_logs();
    let document = adapter::document_from_path("/%3Cesi%3Ainclude%20src%3D%22%2Fa%22%2F%3E/");
    assert_eq!(document, r#"<esi:include src="/a"/>"#);
    let result = adapter::respond(&processor(EchoFetcher), &document).await?;
    assert_eq!(result, "/a");
    Ok(())
}

#[tokio::test]
async fn test_onerror_continue() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().failing("/broken", 404);
    let result = processor(fetcher)
        .process_document(r#"a<esi:include src="/broken" onerror="continue"/>b"#)
        .await?;
    assert_eq!(result, "ab");
    Ok(())
}

#[tokio::test]
async fn test_alt_is_used_when_src_fails() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new()
        .failing("/broken", 500)
        .route("/fallback", "fallback");
    let result = processor(fetcher.clone())
        .process_document(r#"<esi:include src="/broken" alt="/fallback"/>"#)
        .await?;
    assert_eq!(result, "fallback");
    assert_eq!(fetcher.requests(), vec!["/broken", "/fallback"]);
    Ok(())
}

#[tokio::test]
async fn test_alt_failure() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new()
        .failing("/broken", 500)
        .failing("/also-broken", 502);

    let result = processor(fetcher.clone())
        .process_document(r#"<esi:include src="/broken" alt="/also-broken"/>"#)
        .await;
    assert!(matches!(
        result,
        Err(ExecutionError::UnresolvedInclude { ref url, .. }) if url == "/broken"
    ));

    let result = processor(fetcher)
        .process_document(r#"[<esi:include src="/broken" alt="/also-broken" onerror="continue"/>]"#)
        .await?;
    assert_eq!(result, "[]");
    Ok(())
}

#[tokio::test]
async fn test_dca_esi_processes_fragment_in_child_scope() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route(
        "/fragment",
        r#"<esi:assign name="colour" value="'inner'"/>[$(colour)|$(size)]"#,
    );
    let input = r#"<esi:assign name="colour" value="'outer'"/><esi:assign name="size" value="'large'"/><esi:include src="/fragment" dca="esi"/>$(colour)"#;
    let result = process_esi_document(input, fetcher, Variables::new()).await?;
    assert_eq!(result, "[inner|large]outer");
    Ok(())
}

#[tokio::test]
async fn test_fragment_without_dca_is_verbatim() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("/fragment", "<esi:vars>$(colour)</esi:vars>");
    let variables = Variables::from([("colour".to_string(), Value::from("red"))]);
    let result =
        process_esi_document(r#"<esi:include src="/fragment"/>"#, fetcher, variables).await?;
    assert_eq!(result, "<esi:vars>$(colour)</esi:vars>");
    Ok(())
}

#[tokio::test]
async fn test_choose_second_when() -> Result<()> {
    init_logs();
    let input = r#"<esi:choose><esi:when test="a == b">first</esi:when><esi:when test="a == a">second</esi:when><esi:otherwise>otherwise</esi:otherwise></esi:choose>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, "second");
    Ok(())
}

#[tokio::test]
async fn test_choose_otherwise() -> Result<()> {
    init_logs();
    let input = r#"<esi:choose>
        <esi:when test="a == b">first</esi:when>
        <esi:when test="'x' has 'y'">second</esi:when>
        <esi:otherwise>otherwise</esi:otherwise>
    </esi:choose>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result.trim(), "otherwise");
    Ok(())
}

#[tokio::test]
async fn test_choose_state_does_not_leak_to_sibling() -> Result<()> {
    init_logs();
    let input = r#"<esi:choose><esi:when test="a == a">1</esi:when></esi:choose><esi:choose><esi:when test="a == b">2</esi:when><esi:otherwise>3</esi:otherwise></esi:choose>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, "13");
    Ok(())
}

#[tokio::test]
async fn test_nested_choose() -> Result<()> {
    init_logs();
    let input = r#"<esi:choose><esi:when test="a == a">[<esi:choose><esi:when test="x == y">no</esi:when><esi:otherwise>inner</esi:otherwise></esi:choose>]</esi:when><esi:otherwise>outer</esi:otherwise></esi:choose>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, "[inner]");
    Ok(())
}

#[tokio::test]
async fn test_esi_choose_with_query_string() -> Result<()> {
    init_logs();
    let input = r#"
        <esi:choose>
            <esi:when test="$(QUERY_STRING{param}) == 'value'">
                Match
            </esi:when>
            <esi:otherwise>
                Fallback
            </esi:otherwise>
        </esi:choose>
    "#;
    let result =
        process_esi_document(input, EchoFetcher, query_string(&[("param", "value")])).await?;
    assert_eq!(result.trim(), "Match");
    Ok(())
}

#[tokio::test]
async fn test_when_matchname() -> Result<()> {
    init_logs();
    let input = r#"<esi:choose><esi:when test="$(path) matches '''^/(news|sport)/(\d+)$'''" matchname="parts">$(parts{1})-$(parts{2})</esi:when></esi:choose>"#;
    let variables = Variables::from([("path".to_string(), Value::from("/news/42"))]);
    let result = process_esi_document(input, EchoFetcher, variables).await?;
    assert_eq!(result, "news-42");
    Ok(())
}

#[tokio::test]
async fn test_choose_only_includes_matching_branch() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("/yes", "yes").route("/no", "no");
    let input = r#"<esi:choose><esi:when test="$(HTTP_HOST) == 'example.com'"><esi:include src="/yes"/></esi:when><esi:otherwise><esi:include src="/no"/></esi:otherwise></esi:choose>"#;
    let variables = Variables::from([("HTTP_HOST".to_string(), Value::from("example.com"))]);
    let result = process_esi_document(input, fetcher.clone(), variables).await?;
    assert_eq!(result, "yes");
    assert_eq!(fetcher.requests(), vec!["/yes"]);
    Ok(())
}

#[tokio::test]
async fn test_assign() -> Result<()> {
    init_logs();
    let input = r#"<esi:assign name="who" value="'world'"/>hello $(who)<esi:assign name="long">'form'</esi:assign> $(long)"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, "hello world form");
    Ok(())
}

#[tokio::test]
async fn test_assign_copies_values() -> Result<()> {
    init_logs();
    let input = r#"<esi:assign name="copy" value="$(QUERY_STRING)"/><esi:vars>$(copy{param}) $upper($(copy{param}))</esi:vars>"#;
    let result =
        process_esi_document(input, EchoFetcher, query_string(&[("param", "value")])).await?;
    assert_eq!(result, "value VALUE");
    Ok(())
}

#[tokio::test]
async fn test_try_uses_except_when_attempt_fails() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().failing("/broken", 500);
    let input = r#"<esi:try><esi:attempt>A<esi:include src="/broken"/></esi:attempt><esi:except>fallback</esi:except></esi:try>"#;
    let result = processor(fetcher).process_document(input).await?;
    assert_eq!(result, "fallback");
    Ok(())
}

#[tokio::test]
async fn test_try_attempt_success() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("/ok", "ok");
    let input = r#"<esi:try>
        <esi:attempt>A<esi:include src="/ok"/></esi:attempt>
        <esi:except><esi:include src="/never"/></esi:except>
    </esi:try>"#;
    let result = processor(fetcher.clone()).process_document(input).await?;
    assert_eq!(result, "Aok");
    assert_eq!(fetcher.requests(), vec!["/ok"]);
    Ok(())
}

#[tokio::test]
async fn test_try_without_except_propagates() {
    init_logs();
    let fetcher = MockFetcher::new().failing("/broken", 500);
    let input = r#"<esi:try><esi:attempt><esi:include src="/broken"/></esi:attempt></esi:try>"#;
    let result = processor(fetcher).process_document(input).await;
    assert!(matches!(
        result,
        Err(ExecutionError::UnresolvedInclude { .. })
    ));
}

#[tokio::test]
async fn test_failing_except_propagates() {
    init_logs();
    let fetcher = MockFetcher::new().failing("/broken", 500);
    let input = r#"<esi:try><esi:attempt><esi:include src="/broken"/></esi:attempt><esi:except><esi:include src="/broken"/></esi:except></esi:try>"#;
    let result = processor(fetcher).process_document(input).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_text_is_verbatim() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new();
    let input = r#"<esi:text><esi:include src="/x"/> $(HTTP_HOST)</esi:text>"#;
    let result = processor(fetcher.clone()).process_document(input).await?;
    assert_eq!(result, r#"<esi:include src="/x"/> $(HTTP_HOST)"#);
    assert!(fetcher.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_comment_and_remove() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new();
    let input = r#"a<esi:comment text="note"/>b<esi:remove><esi:include src="/x"/></esi:remove>c"#;
    let result = processor(fetcher.clone()).process_document(input).await?;
    assert_eq!(result, "abc");
    assert!(fetcher.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_tag_passes_through() -> Result<()> {
    init_logs();
    let input = r#"<esi:inline name="x" fetchable="yes">content</esi:inline>"#;
    let result = processor(EchoFetcher).process_document(input).await?;
    assert_eq!(result, input);
    Ok(())
}

#[tokio::test]
async fn test_vars() -> Result<()> {
    init_logs();
    let variables = Variables::from([("HTTP_HOST".to_string(), Value::from("example.com"))]);
    let input = r#"<esi:vars name="$(HTTP_HOST)"/>|<esi:vars>host=$(HTTP_HOST)</esi:vars>"#;
    let result = process_esi_document(input, EchoFetcher, variables).await?;
    assert_eq!(result, "example.com|host=example.com");
    Ok(())
}

#[tokio::test]
async fn test_query_string_subfield() -> Result<()> {
    init_logs();
    let input = r#"
        <esi:vars>
            $(QUERY_STRING{param})
        </esi:vars>
    "#;
    let result =
        process_esi_document(input, EchoFetcher, query_string(&[("param", "value")])).await?;
    assert_eq!(result.trim(), "value");
    Ok(())
}

#[tokio::test]
async fn test_missing_closing_bracket_is_empty() -> Result<()> {
    init_logs();
    let input = "<esi:vars>[$(QUERY_STRING{param)]</esi:vars>";
    let result =
        process_esi_document(input, EchoFetcher, query_string(&[("param", "value")])).await?;
    assert_eq!(result, "[]");
    Ok(())
}

#[tokio::test]
async fn test_esi_comments() -> Result<()> {
    init_logs();
    let variables = Variables::from([("HTTP_HOST".to_string(), Value::from("example.com"))]);
    let input = "<!--esi $(HTTP_HOST) -->";

    let result = process_esi_document(input, EchoFetcher, variables.clone()).await?;
    assert_eq!(result, " example.com ");

    let result = Processor::new(EchoFetcher, Configuration::default().with_esi_comments(false))
        .process_document_with(input, variables)
        .await?;
    assert_eq!(result, "<!--esi example.com -->");
    Ok(())
}

#[tokio::test]
async fn test_interpret_outside_tag_leaves_text() -> Result<()> {
    init_logs();
    let mut variables = Variables::from([("v".to_string(), Value::from("value"))]);
    let result = processor(EchoFetcher)
        .interpret("$(v)<esi:vars>$(v)</esi:vars>", &mut variables, false)
        .await?;
    assert_eq!(result, "$(v)value");
    Ok(())
}

#[tokio::test]
async fn test_interpret_keeps_assignments() -> Result<()> {
    init_logs();
    let mut variables = Variables::new();
    processor(EchoFetcher)
        .interpret(r#"<esi:assign name="seen" value="'yes'"/>"#, &mut variables, true)
        .await?;
    assert_eq!(variables.get("seen"), Some(&Value::from("yes")));
    Ok(())
}

#[tokio::test]
async fn test_functions() -> Result<()> {
    init_logs();
    let variables = Variables::from([("name".to_string(), Value::from(" World "))]);
    let input = "<esi:vars>Hello $upper($strip($(name)))$dollar() $lower(bareword)</esi:vars>";
    let result = process_esi_document(input, EchoFetcher, variables).await?;
    assert_eq!(result, "Hello WORLD$ $lower(bareword)");
    Ok(())
}

#[tokio::test]
async fn test_custom_function() -> Result<()> {
    init_logs();
    let functions = FunctionRegistry::default().with_function("shout", |args: &[Value]| {
        let text = args.first().map(Value::to_string).unwrap_or_default();
        Ok(Value::from(format!("{}!", text.to_uppercase())))
    });
    let result = processor(EchoFetcher)
        .with_functions(functions)
        .process_document("<esi:vars>$shout('hi')</esi:vars>")
        .await?;
    assert_eq!(result, "HI!");
    Ok(())
}

#[tokio::test]
async fn test_include_url_substitution_and_unescaping() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("http://example.com/frag?a=1&b=2", "fragment");
    let variables = Variables::from([("HTTP_HOST".to_string(), Value::from("example.com"))]);
    let input = r#"<esi:include src="http://$(HTTP_HOST)/frag?a=1&amp;b=2"/>"#;

    let result = process_esi_document(input, fetcher.clone(), variables.clone()).await?;
    assert_eq!(result, "fragment");
    assert_eq!(fetcher.requests(), vec!["http://example.com/frag?a=1&b=2"]);

    let raw = Processor::new(EchoFetcher, Configuration::default().with_escaped(false))
        .process_document_with(input, variables)
        .await?;
    assert_eq!(raw, "http://example.com/frag?a=1&amp;b=2");
    Ok(())
}

#[tokio::test]
async fn test_include_url_with_bare_ampersands() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new()
        .route("/x?a=1&b=2", "x")
        .route("/y?a=1&b=2&c=3", "y");
    let input = r#"<esi:include src="/x?a=1&b=2"/>|<esi:include src="/y?a=1&b=2&amp;c=3"/>"#;

    let result = processor(fetcher.clone()).process_document(input).await?;
    assert_eq!(result, "x|y");
    assert_eq!(fetcher.requests(), vec!["/x?a=1&b=2", "/y?a=1&b=2&c=3"]);
    Ok(())
}

#[tokio::test]
async fn test_dca_fragment_sees_later_assignments() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("/frag", "[$(late)]");
    let input = r#"<esi:include src="/frag" dca="esi"/><esi:assign name="late" value="'1'"/>"#;
    let result = process_esi_document(input, fetcher, Variables::new()).await?;
    assert_eq!(result, "[1]");
    Ok(())
}

#[tokio::test]
async fn test_dca_fragment_in_attempt_sees_later_assignments() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new().route("/frag", "[$(late)]");
    let input = r#"<esi:try><esi:attempt><esi:include src="/frag" dca="esi"/></esi:attempt></esi:try><esi:assign name="late" value="'2'"/>"#;
    let result = process_esi_document(input, fetcher, Variables::new()).await?;
    assert_eq!(result, "[2]");
    Ok(())
}

#[tokio::test]
async fn test_include_without_src() -> Result<()> {
    init_logs();
    let fetcher = MockFetcher::new();
    let result = processor(fetcher.clone())
        .process_document(r#"a<esi:include/>b<esi:include src=""/>c"#)
        .await?;
    assert_eq!(result, "abc");
    assert!(fetcher.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_custom_namespace() -> Result<()> {
    init_logs();
    let variables = Variables::from([("x".to_string(), Value::from("X"))]);
    let result = Processor::new(EchoFetcher, Configuration::default().with_namespace("app"))
        .process_document_with("<app:vars>$(x)</app:vars><esi:vars>esi</esi:vars>", variables)
        .await?;
    assert_eq!(result, "X<esi:vars>esi</esi:vars>");
    Ok(())
}
