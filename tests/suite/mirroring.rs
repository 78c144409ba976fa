//! Scratch mirrors of a story workspace.

use ink_ls_engine::{MirrorState, SourceFilter, WorkspaceMirror};

use crate::common::{StoryWorkspace, list_files};

#[tokio::test]
async fn mirror_holds_only_story_sources() {
    let workspace = StoryWorkspace::sample();
    let scratch = tempfile::tempdir().unwrap();
    let mirror = WorkspaceMirror::new(scratch.path(), SourceFilter::default());

    mirror.register(&workspace.root_uri()).unwrap();
    let entry = mirror.ensure_ready(&workspace.root_uri()).await.unwrap();
    let copy = entry.scratch().expect("ready entries have a scratch dir");

    assert!(copy.starts_with(scratch.path()));
    assert_eq!(list_files(copy), vec!["main.ink", "story/a.ink2"]);
    assert_eq!(
        mirror.state(&workspace.root_uri()),
        Some(MirrorState::Ready(copy.to_path_buf()))
    );
}

#[tokio::test]
async fn mirroring_twice_gives_distinct_identical_copies() {
    let workspace = StoryWorkspace::sample();
    let scratch = tempfile::tempdir().unwrap();
    let mirror = WorkspaceMirror::new(scratch.path(), SourceFilter::default());

    let first = mirror.create_mirror(workspace.root()).await.unwrap();
    let second = mirror.create_mirror(workspace.root()).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(list_files(&first), list_files(&second));
    assert_eq!(
        std::fs::read_to_string(first.join("story/a.ink2")).unwrap(),
        std::fs::read_to_string(workspace.root().join("story/a.ink2")).unwrap()
    );
}

#[tokio::test]
async fn document_edits_land_in_the_mirror_only() {
    let workspace = StoryWorkspace::sample();
    let scratch = tempfile::tempdir().unwrap();
    let mirror = WorkspaceMirror::new(scratch.path(), SourceFilter::default());
    mirror.register(&workspace.root_uri()).unwrap();
    let entry = mirror.ensure_ready(&workspace.root_uri()).await.unwrap();

    let document = workspace.root().join("main.ink");
    mirror
        .apply_document_edit(&document, "Edited.\n", &entry)
        .await
        .unwrap();

    let copy = entry.scratch().unwrap();
    assert_eq!(
        std::fs::read_to_string(copy.join("main.ink")).unwrap(),
        "Edited.\n"
    );
    assert_eq!(
        std::fs::read_to_string(&document).unwrap(),
        "INCLUDE story/a.ink2\nHello.\n"
    );
}
