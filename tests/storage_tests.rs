use cas_file_manager::storage::Database;

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

#[test]
fn test_insert_and_check_reference() {
    let (_dir, db) = test_db();

    assert!(db.insert_reference(HASH_A, "docs/a.txt").unwrap());
    assert!(db.reference_exists(HASH_A, "docs/a.txt").unwrap());
    assert!(!db.reference_exists(HASH_A, "docs/b.txt").unwrap());
    assert!(!db.reference_exists(HASH_B, "docs/a.txt").unwrap());
}

#[test]
fn test_insert_duplicate_reference() {
    let (_dir, db) = test_db();

    assert!(db.insert_reference(HASH_A, "docs/a.txt").unwrap());
    assert!(!db.insert_reference(HASH_A, "docs/a.txt").unwrap());
    assert_eq!(db.references_for(HASH_A).unwrap().len(), 1);
}

#[test]
fn test_remove_reference() {
    let (_dir, db) = test_db();
    db.insert_reference(HASH_A, "docs/a.txt").unwrap();

    assert!(db.remove_reference(HASH_A, "docs/a.txt").unwrap());
    assert!(!db.remove_reference(HASH_A, "docs/a.txt").unwrap());
    assert!(!db.has_references(HASH_A).unwrap());
}

#[test]
fn test_references_are_scoped_to_their_hash() {
    let (_dir, db) = test_db();
    db.insert_reference(HASH_A, "docs/a.txt").unwrap();
    db.insert_reference(HASH_A, "img/b.png").unwrap();
    db.insert_reference(HASH_B, "docs/c.txt").unwrap();

    assert_eq!(
        db.references_for(HASH_A).unwrap(),
        vec!["docs/a.txt".to_string(), "img/b.png".to_string()]
    );
    assert_eq!(
        db.references_for(HASH_B).unwrap(),
        vec!["docs/c.txt".to_string()]
    );

    db.remove_reference(HASH_B, "docs/c.txt").unwrap();
    assert!(db.has_references(HASH_A).unwrap());
    assert!(!db.has_references(HASH_B).unwrap());
}

#[test]
fn test_all_references() {
    let (_dir, db) = test_db();
    db.insert_reference(HASH_B, "docs/c.txt").unwrap();
    db.insert_reference(HASH_A, "docs/a.txt").unwrap();

    let all = db.all_references().unwrap();
    assert_eq!(
        all,
        vec![
            (HASH_A.to_string(), "docs/a.txt".to_string()),
            (HASH_B.to_string(), "docs/c.txt".to_string()),
        ]
    );
}

#[test]
fn test_references_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(dir.path().join("data")).unwrap();
        db.insert_reference(HASH_A, "docs/a.txt").unwrap();
    }

    let db = Database::open(dir.path().join("data")).unwrap();
    assert!(db.reference_exists(HASH_A, "docs/a.txt").unwrap());
}
