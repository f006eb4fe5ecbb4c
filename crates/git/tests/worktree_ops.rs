use std::fs;

use git::GitCli;
use tempfile::TempDir;

fn seeded_repo(td: &TempDir) -> std::path::PathBuf {
    let repo = td.path().join("repo");
    let cli = GitCli::new();
    cli.init_repo(&repo, "main").unwrap();
    fs::write(repo.join("README.md"), "hello\n").unwrap();
    cli.commit_all(&repo, "initial").unwrap();
    repo
}

#[test]
fn worktree_add_list_remove_roundtrip() {
    let td = TempDir::new().unwrap();
    let repo = seeded_repo(&td);
    let cli = GitCli::new();

    let wt = td.path().join("wt-one");
    cli.worktree_add(&repo, &wt, "stream/ISSUE-001", true, false).unwrap();
    assert!(wt.join(".git").is_file());

    let entries = cli.worktree_list(&repo).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_main);
    assert_eq!(entries[1].branch.as_deref(), Some("stream/ISSUE-001"));

    cli.worktree_remove(&repo, &wt, true).unwrap();
    cli.worktree_prune(&repo).unwrap();
    assert_eq!(cli.worktree_list(&repo).unwrap().len(), 1);

    // branch survives worktree removal
    assert!(cli.branch_exists(&repo, "stream/ISSUE-001").unwrap());
}

#[test]
fn branch_lifecycle_and_queries() {
    let td = TempDir::new().unwrap();
    let repo = seeded_repo(&td);
    let cli = GitCli::new();

    cli.create_branch(&repo, "feature", None).unwrap();
    assert!(cli.list_branches(&repo).unwrap().contains(&"feature".to_string()));
    assert_eq!(cli.current_branch(&repo).unwrap(), "main");

    let head = cli.current_commit(&repo).unwrap();
    assert_eq!(cli.branch_commit(&repo, "feature").unwrap(), head);

    cli.delete_branch(&repo, "feature", false).unwrap();
    assert!(!cli.branch_exists(&repo, "feature").unwrap());
}

#[test]
fn advance_branch_requires_descendant() {
    let td = TempDir::new().unwrap();
    let repo = seeded_repo(&td);
    let cli = GitCli::new();

    cli.create_branch(&repo, "stream", None).unwrap();
    fs::write(repo.join("file.txt"), "work\n").unwrap();
    let new_head = cli.commit_all(&repo, "work").unwrap();

    cli.advance_branch(&repo, "stream", &new_head).unwrap();
    assert_eq!(cli.branch_commit(&repo, "stream").unwrap(), new_head);

    // advancing backwards is refused
    let base = cli.rev_parse(&repo, "stream~1").unwrap();
    assert!(cli.advance_branch(&repo, "stream", &base).is_err());
}

#[test]
fn merge_tree_reports_conflicts_without_mutation() {
    let td = TempDir::new().unwrap();
    let repo = seeded_repo(&td);
    let cli = GitCli::new();

    cli.create_branch(&repo, "side", None).unwrap();

    fs::write(repo.join("README.md"), "main edit\n").unwrap();
    cli.commit_all(&repo, "main edit").unwrap();

    // commit a conflicting change on `side` via a worktree
    let wt = td.path().join("wt-side");
    cli.worktree_add(&repo, &wt, "side", false, false).unwrap();
    fs::write(wt.join("README.md"), "side edit\n").unwrap();
    cli.commit_all(&wt, "side edit").unwrap();

    let conflicts = cli.merge_tree_conflicts(&repo, "main", "side").unwrap();
    assert_eq!(conflicts, vec!["README.md".to_string()]);

    // probe must not have touched the working tree
    assert_eq!(fs::read_to_string(repo.join("README.md")).unwrap(), "main edit\n");
}
