//! Recipe detection and preview through the CatalogueService.

use std::sync::Arc;

use catalogue_extraction::{
    CatalogueService, CatalogueType, ClassifierConfig, EngineConfig, Error, LlmTask,
    MemoryJobQueue, MemoryStore, MockBrowser, MockLlm, PageType, PaginationConfiguration, Recipe,
    RecipeConfiguration, RecipeDetectionStatus, RetryPolicy, UrlPatternType,
};

const INDEX_URL: &str = "https://a.edu/courses";

fn index_page(ids: impl IntoIterator<Item = u32>) -> String {
    let mut page = String::from("# Courses\n\n");
    for id in ids {
        page.push_str(&format!("[BIO {id}](/course/{id})\n"));
    }
    page
}

fn course_site(count: u32) -> MockBrowser {
    let mut browser = MockBrowser::new().with_page(INDEX_URL, index_page(1..=count));
    for id in 1..=count {
        browser = browser.with_page(
            format!("https://a.edu/course/{id}"),
            format!("Course BIO {id}: Topic {id}\nStudy of topic {id}.\n"),
        );
    }
    browser
}

fn service(browser: MockBrowser, llm: MockLlm) -> CatalogueService {
    let config = EngineConfig::default()
        .with_retry(RetryPolicy::immediate(1))
        .with_classifier(ClassifierConfig::default().with_votes(1));
    CatalogueService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJobQueue::new()),
        Arc::new(browser),
        Arc::new(llm),
        config,
    )
}

async fn new_recipe(service: &CatalogueService) -> Recipe {
    let catalogue = service
        .create_catalogue("State University", "https://a.edu", CatalogueType::Courses)
        .await
        .unwrap();
    service.create_recipe(catalogue.id, INDEX_URL).await.unwrap()
}

#[tokio::test]
async fn test_index_of_detail_pages_is_detected() {
    let llm = MockLlm::new()
        .with_page_type("DETAIL_LINKS")
        .with_no_pagination()
        .with_url_regexp(r"/course/\d+", &["/course/1"])
        .with_default_page_type("DETAIL");
    let service = service(course_site(30), llm.clone());
    let recipe = new_recipe(&service).await;
    assert_eq!(recipe.status, RecipeDetectionStatus::Waiting);
    assert!(recipe.is_default);

    let recipe = service.detect_recipe(recipe.id).await.unwrap();

    assert_eq!(recipe.status, RecipeDetectionStatus::Success);
    assert!(recipe.failure_reason.is_none());
    let configuration = recipe.configuration.unwrap();
    assert_eq!(configuration.page_type, PageType::DetailLinks);
    assert_eq!(configuration.link_regexp.as_deref(), Some(r"/course/\d+"));
    assert_eq!(configuration.links.as_deref(), Some(&RecipeConfiguration::detail()));
    // Root plus a bounded sample of children
    assert_eq!(llm.calls_for(LlmTask::ClassifyPageType), 6);
}

#[tokio::test]
async fn test_mixed_children_fail_detection_until_reconfigured() {
    let llm = MockLlm::new()
        .with_page_type("DETAIL_LINKS")
        .with_no_pagination()
        .with_url_regexp(r"/course/\d+", &["/course/1"])
        .with_page_type("DETAIL")
        .with_default_page_type("CATEGORY_LINKS");
    let service = service(course_site(8), llm);
    let recipe = new_recipe(&service).await;

    let recipe = service.detect_recipe(recipe.id).await.unwrap();
    assert_eq!(recipe.status, RecipeDetectionStatus::Error);
    assert!(recipe.configuration.is_none());
    assert!(recipe.failure_reason.as_deref().unwrap().contains("mixed content"));
    assert!(matches!(
        service.start_extraction(recipe.id).await,
        Err(Error::InvalidConfiguration(_))
    ));

    let configuration =
        RecipeConfiguration::links(PageType::DetailLinks, r"/course/\d+", RecipeConfiguration::detail());
    let recipe = service
        .reconfigure_recipe(recipe.id, configuration.clone())
        .await
        .unwrap();
    assert_eq!(recipe.status, RecipeDetectionStatus::Success);
    assert!(recipe.failure_reason.is_none());
    assert_eq!(recipe.configuration, Some(configuration));
}

#[tokio::test]
async fn test_invalid_reconfiguration_is_rejected() {
    let service = service(course_site(1), MockLlm::new());
    let recipe = new_recipe(&service).await;

    let missing_links = RecipeConfiguration {
        links: None,
        ..RecipeConfiguration::links(PageType::DetailLinks, r"/course/\d+", RecipeConfiguration::detail())
    };
    let err = service
        .reconfigure_recipe(recipe.id, missing_links)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));

    let bad_pattern = RecipeConfiguration::links(
        PageType::DetailLinks,
        r"/course/\d+",
        RecipeConfiguration::detail(),
    )
    .with_pagination(PaginationConfiguration {
        url_pattern_type: UrlPatternType::Offset,
        url_pattern: "https://a.edu/courses?page={page_num}".to_string(),
        total_pages: 4,
        offset_step: Some(20),
    });
    assert!(service.reconfigure_recipe(recipe.id, bad_pattern).await.is_err());

    let unchanged = service.set_default_recipe(recipe.id).await.unwrap();
    assert_eq!(unchanged.status, RecipeDetectionStatus::Waiting);
    assert!(unchanged.configuration.is_none());
}

#[tokio::test]
async fn test_default_recipe_is_exclusive() {
    let service = service(course_site(1), MockLlm::new());
    let first = new_recipe(&service).await;
    let second = service
        .create_recipe(first.catalogue_id, "https://a.edu/programs")
        .await
        .unwrap();
    assert!(first.is_default);
    assert!(!second.is_default);

    let second = service.set_default_recipe(second.id).await.unwrap();
    assert!(second.is_default);
    let first = service.set_default_recipe(first.id).await.unwrap();
    assert!(first.is_default);
}

#[tokio::test]
async fn test_uncrawlable_recipe_url_is_rejected() {
    let service = service(MockBrowser::new(), MockLlm::new());
    let catalogue = service
        .create_catalogue("State University", "https://a.edu", CatalogueType::Courses)
        .await
        .unwrap();

    let err = service
        .create_recipe(catalogue.id, "mailto:registrar@a.edu")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration(_)));
}

#[tokio::test]
async fn test_preview_url_regexp_lists_matching_links() {
    let llm = MockLlm::new().with_url_regexp(r"/course/\d+", &["/course/2"]);
    let service = service(course_site(3), llm);

    let preview = service
        .preview_url_regexp(INDEX_URL, CatalogueType::Courses, PageType::DetailLinks)
        .await
        .unwrap();

    assert_eq!(preview.regexp, r"/course/\d+");
    assert_eq!(
        preview.links,
        vec![
            "https://a.edu/course/1".to_string(),
            "https://a.edu/course/2".to_string(),
            "https://a.edu/course/3".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_preview_pagination() {
    let browser = MockBrowser::new().with_page(
        INDEX_URL,
        format!("{}\n[Next](/courses?page=2)\n", index_page(1..=2)),
    );
    let llm = MockLlm::new().with_pagination(
        "page_num",
        "https://a.edu/courses?page={page_num}",
        5,
        None,
    );
    let service = service(browser, llm);

    let pagination = service
        .preview_pagination(INDEX_URL, CatalogueType::Courses)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pagination.url_pattern_type, UrlPatternType::PageNum);
    assert_eq!(pagination.total_pages, 5);
    let urls = pagination.page_urls();
    assert_eq!(urls.len(), 4);
    assert_eq!(urls[0], "https://a.edu/courses?page=2");
    assert_eq!(urls[3], "https://a.edu/courses?page=5");
}

#[tokio::test]
async fn test_single_page_is_not_paginated() {
    let browser = MockBrowser::new().with_page(INDEX_URL, index_page(1..=2));
    let llm = MockLlm::new().with_pagination(
        "page_num",
        "https://a.edu/courses?page={page_num}",
        1,
        None,
    );
    let service = service(browser, llm);

    let pagination = service
        .preview_pagination(INDEX_URL, CatalogueType::Courses)
        .await
        .unwrap();
    assert!(pagination.is_none());
}

#[tokio::test]
async fn test_unreachable_root_fails_detection() {
    let service = service(MockBrowser::new(), MockLlm::new());
    let recipe = new_recipe(&service).await;

    let recipe = service.detect_recipe(recipe.id).await.unwrap();
    assert_eq!(recipe.status, RecipeDetectionStatus::Error);
    assert!(recipe.failure_reason.as_deref().unwrap().contains("HTTP 404"));
}
