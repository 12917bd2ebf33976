use criterion::{criterion_group, criterion_main, Criterion};
use page_mirror::classifier::{ResourceCategory, UriClassifier};
use page_mirror::file_manager::{sanitize_file_name, LocalStore, PathPlanner};
use page_mirror::html_parser::{css_urls, scan, srcset_candidates, HtmlDocument};
use page_mirror::text_extract::TextExtractor;
use page_mirror::TextConfig;
use std::hint::black_box;
use tempfile::tempdir;

const PAGE: &str = r#"
    <html>
        <head>
            <link rel="stylesheet" href="/style.css">
            <link rel="icon" href="/favicon.ico">
            <script src="/script.js"></script>
            <style>
                .hero { background: url('/images/hero.jpg') }
                @font-face { src: url("/fonts/body.woff2") }
            </style>
        </head>
        <body>
            <img src="/logo.png" alt="Logo">
            <img srcset="/banner-480.jpg 480w, /banner-1080.jpg 1080w">
            <div style="background-image: url(/images/tile.png)"></div>
            <video src="/media/intro.mp4"><source src="/media/intro.webm"></video>
            <main>
                <h1>Heading</h1>
                <p>A paragraph that is long enough to be kept in the extracted text.</p>
                <ul><li>One</li><li>Two</li></ul>
            </main>
        </body>
    </html>
"#;

fn bench_scan(c: &mut Criterion) {
    c.bench_function("scan_references", |b| {
        b.iter(|| {
            let doc = HtmlDocument::parse(black_box(PAGE));
            let _outcome = scan(&doc);
        });
    });
}

fn bench_css_urls(c: &mut Criterion) {
    let css = r#"
        .bg1 { background-image: url('/images/bg1.jpg'); }
        .bg2 { background: url("/images/bg2.jpg"); }
        .bg3 { background-image: url(/images/bg3.jpg); }
        .bg4 { background-color: red; }
        .font { src: url(data:font/woff2;base64,d09GMg==) format("woff2"); }
    "#;

    c.bench_function("css_urls", |b| {
        b.iter(|| {
            let _ranges = css_urls(black_box(css));
        });
    });
}

fn bench_srcset(c: &mut Criterion) {
    let srcset = "a.png 1x, b.png 2x, data:image/png;base64,AAAA 3x, /img/c%20d.png 480w";

    c.bench_function("srcset_candidates", |b| {
        b.iter(|| {
            let _ranges = srcset_candidates(black_box(srcset));
        });
    });
}

fn bench_file_name_sanitization(c: &mut Criterion) {
    let test_names = vec![
        "normal.png",
        "name with spaces.css",
        "name?with=query",
        "name#fragment.js",
        "a<b>c:d\"e|f*g.woff2",
    ];

    c.bench_function("sanitize_file_names", |b| {
        b.iter(|| {
            for name in &test_names {
                let _sanitized = sanitize_file_name(black_box(name));
            }
        });
    });
}

fn bench_path_planning(c: &mut Criterion) {
    let classifier = UriClassifier::new("https://example.com/subdir/").unwrap();
    let sources: Vec<_> = [
        "../style.css",
        "images/photo.jpg",
        "https://cdn.example.com/photo.jpg",
        "//cdn.example.com/script.js",
        "data:image/png;base64,AAAA",
    ]
    .iter()
    .map(|raw| classifier.classify(raw).unwrap())
    .collect();

    c.bench_function("plan_paths", |b| {
        b.iter(|| {
            let mut planner = PathPlanner::new();
            for source in &sources {
                let _plan = planner.plan(black_box(source.clone()), ResourceCategory::Image);
            }
        });
    });
}

fn bench_store(c: &mut Criterion) {
    let temp_dir = tempdir().unwrap();
    let store = LocalStore::new(temp_dir.path()).unwrap();
    let classifier = UriClassifier::new("https://example.com/").unwrap();
    let plan = PathPlanner::new().plan(
        classifier.classify("/bench.css").unwrap(),
        ResourceCategory::Css,
    );
    let content = b"body { color: red; background: url('/images/bg.png') }";

    c.bench_function("store_resource", |b| {
        b.iter(|| {
            let _resolved = store.store(&plan, black_box(content), Some("text/css"));
        });
    });
}

fn bench_text_extraction(c: &mut Criterion) {
    let config = TextConfig::default();
    let extractor = TextExtractor::new(&config);

    c.bench_function("extract_text", |b| {
        b.iter(|| {
            let _doc = extractor.extract(black_box(PAGE));
        });
    });
}

criterion_group!(
    benches,
    bench_scan,
    bench_css_urls,
    bench_srcset,
    bench_file_name_sanitization,
    bench_path_planning,
    bench_store,
    bench_text_extraction,
);
criterion_main!(benches);
