mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bifrost::Chain;
use bifrost::config::RedirectConfig;
use bifrost::context::QueryContext;
use bifrost::message::{Message, RecordClass, RecordType};
use bifrost::redirect::{NameMatcher, RedirectStage};

use common::Probe;

fn redirect_chain(stage: RedirectStage, probe: Probe) -> Chain {
    Chain::new(vec![Arc::new(stage), Arc::new(probe)])
}

#[tokio::test]
async fn rewrite_round_trip_restores_name_and_adds_alias() {
    let stage = RedirectStage::from_rules(&RedirectConfig {
        rules: vec!["example.com target.example.net".to_string()],
    })
    .unwrap();
    let probe = Probe::answering(Ipv4Addr::new(10, 0, 0, 1));
    let chain = redirect_chain(stage, probe);

    let mut ctx = QueryContext::new(Message::query("example.com", RecordType::A));
    chain.run(&mut ctx).await.unwrap();

    // The outgoing query is restored after the chain unwinds.
    assert_eq!(ctx.query().question().unwrap().name(), "example.com");

    let resp = ctx.response().expect("response");
    assert_eq!(resp.questions[0].name(), "example.com");

    // Exactly one synthetic alias, first in the answer section.
    assert_eq!(resp.answers.len(), 2);
    assert_eq!(resp.answers[0].rtype, RecordType::CNAME);
    assert_eq!(resp.answers[0].name(), "example.com");
    assert_eq!(resp.answers[0].ttl, 1);
    // The real answer was produced for the rewritten name.
    assert_eq!(resp.answers[1].name(), "target.example.net");
}

#[tokio::test]
async fn unmatched_names_pass_through_untouched() {
    let stage = RedirectStage::from_rules(&RedirectConfig {
        rules: vec!["example.com target.example.net".to_string()],
    })
    .unwrap();
    let probe = Probe::answering(Ipv4Addr::new(10, 0, 0, 2));
    let chain = redirect_chain(stage, probe);

    let mut ctx = QueryContext::new(Message::query("other.com", RecordType::A));
    chain.run(&mut ctx).await.unwrap();

    let resp = ctx.response().unwrap();
    assert_eq!(resp.answers.len(), 1);
    assert_eq!(resp.answers[0].name(), "other.com");
}

#[tokio::test]
async fn non_inet_queries_are_not_rewritten() {
    let stage = RedirectStage::from_rules(&RedirectConfig {
        rules: vec!["example.com target.example.net".to_string()],
    })
    .unwrap();
    let probe = Probe::answering(Ipv4Addr::new(10, 0, 0, 3));
    let chain = redirect_chain(stage, probe);

    let mut query = Message::query("example.com", RecordType::A);
    query.questions[0].qclass = RecordClass::CH;
    let mut ctx = QueryContext::new(query);
    chain.run(&mut ctx).await.unwrap();

    let resp = ctx.response().unwrap();
    assert_eq!(resp.answers.len(), 1);
    assert_eq!(resp.answers[0].name(), "example.com");
}

struct CountingMatcher {
    lookups: AtomicUsize,
}

impl NameMatcher for CountingMatcher {
    fn lookup(&self, name: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        (name == "hot.example.com").then(|| "cached.example.net".to_string())
    }
}

#[tokio::test]
async fn memo_cache_avoids_rematching_hot_names() {
    let matcher = Arc::new(CountingMatcher {
        lookups: AtomicUsize::new(0),
    });
    let stage = RedirectStage::new(Arc::clone(&matcher) as Arc<dyn NameMatcher>);
    let probe = Probe::answering(Ipv4Addr::new(10, 0, 0, 4));
    let chain = redirect_chain(stage, probe);

    for id in 0..3 {
        let mut query = Message::query("hot.example.com", RecordType::A);
        query.header.id = id;
        let mut ctx = QueryContext::new(query);
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.response().unwrap().answers[0].name(),
            "hot.example.com"
        );
    }
    assert_eq!(matcher.lookups.load(Ordering::SeqCst), 1);
}
