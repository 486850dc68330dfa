use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use glam::{DVec3, IVec3};

use blockwire::block::{self, Block};
use blockwire::entity::{Entity, FallingBody};
use blockwire::event::{BlockEvent, EntityEvent, Event};
use blockwire::generator::FlatGenerator;
use blockwire::region;
use blockwire::chunk::Chunk;
use blockwire::world::{World, WorldError};


fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("blockwire-test-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn negative_chunk_region() {

    let world = World::new();
    world.get_chunk(-1, -33).unwrap();

    assert_eq!(region::calc_region_pos(-1, -33), (-1, -2));
    assert_eq!(region::calc_region_offset(-1, -33), (31, 31));

    let region = world.get_region(-1, -2).unwrap();
    assert_eq!(region.pos(), (-1, -2));
    assert!(region.get_chunk_without_generation(31, 31).is_some());
    assert!(world.get_region(0, 0).is_none());

}

#[test]
fn set_chunk_identity() {

    let world = World::new();
    for (cx, cz) in [(0, 0), (-1, 5), (40, -40)] {
        let installed = world.set_chunk(cx, cz, Chunk::new());
        let got = world.get_chunk(cx, cz).unwrap();
        assert!(Arc::ptr_eq(&installed, &got));
        let chunk = got.read().unwrap();
        assert!(chunk.is_modified());
        let (rx, rz) = region::calc_region_pos(cx, cz);
        assert!(chunk.is_in_region(&world.get_region(rx, rz).unwrap()));
    }

}

#[test]
fn without_generation_has_no_side_effect() {

    let world = World::new().with_generator(FlatGenerator::default());
    assert!(world.get_chunk_without_generation(3, 3).is_none());
    assert!(world.get_chunk_without_generation(-100, 7).is_none());
    assert_eq!(world.region_count(), 0);

    world.get_chunk(3, 3).unwrap();
    assert!(world.get_chunk_without_generation(3, 3).is_some());
    assert!(world.get_chunk_without_generation(3, 4).is_none());
    assert_eq!(world.region_count(), 1);

}

#[test]
fn vertical_range() {

    let world = World::new().with_generator(FlatGenerator::default());

    assert_eq!(world.safe_get_block(IVec3::new(0, -1, 0)).unwrap(), Block::AIR);
    assert_eq!(world.safe_get_block(IVec3::new(0, 256, 0)).unwrap(), Block::AIR);
    assert_eq!(world.safe_get_block(IVec3::new(0, 0, 0)).unwrap(), Block::of(block::BEDROCK));

    assert!(matches!(world.get_block(IVec3::new(0, -1, 0)), Err(WorldError::OutOfRange(_))));
    assert!(matches!(world.get_block(IVec3::new(0, 256, 0)), Err(WorldError::OutOfRange(_))));
    assert!(matches!(world.set_block(IVec3::new(0, 256, 0), Block::AIR), Err(WorldError::OutOfRange(_))));

    // Out of range positions never touch the store.
    assert_eq!(world.region_count(), 1);

}

#[test]
fn boundary_write_resolves_neighbor_chunk() {

    let world = World::new().with_generator(FlatGenerator::default());
    world.set_block(IVec3::new(15, 10, 15), Block::of(block::STONE)).unwrap();

    assert!(world.get_chunk_without_generation(1, 0).is_some());
    assert!(world.get_chunk_without_generation(0, 1).is_some());
    // The neighbor chunk was generated, not only created empty.
    let neighbor = world.get_chunk_without_generation(1, 0).unwrap();
    assert_eq!(neighbor.read().unwrap().get_block(IVec3::new(0, 0, 15)), Block::of(block::BEDROCK));

}

#[test]
fn plant_breaks_without_support() {

    let world = World::new().with_generator(FlatGenerator::default());
    let flower = IVec3::new(2, 4, 2);
    world.set_block(flower, Block::of(block::POPPY)).unwrap();
    assert_eq!(world.get_block(flower).unwrap(), Block::of(block::POPPY));

    world.set_block(flower - IVec3::Y, Block::of(block::STONE)).unwrap();
    assert_eq!(world.get_block(flower).unwrap(), Block::AIR);

}

#[test]
fn block_events() {

    let world = World::new();
    let (_, events) = world.events().subscribe_channel();

    let pos = IVec3::new(-4, 70, 9);
    world.set_block(pos, Block::of(block::GLASS)).unwrap();
    world.set_block(pos, Block::AIR).unwrap();

    let events = events.try_iter().collect::<Vec<_>>();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::Block { pos: p, inner: BlockEvent::Set { block, prev } } 
        if p == pos && block == Block::of(block::GLASS) && prev == Block::AIR));
    assert!(matches!(events[1], Event::Block { inner: BlockEvent::Set { block, .. }, .. } if block.is_air()));

}

#[test]
fn save_and_reload() {

    let dir = temp_dir("reload");
    let world = World::new().with_directory(&dir);

    world.set_block(IVec3::new(-1, 64, -1), Block::new(block::WOOD, 2)).unwrap();
    world.set_block(IVec3::new(600, 1, 3), Block::of(block::COBBLESTONE)).unwrap();
    world.save().unwrap();

    assert!(dir.join("r.-1.-1.mcr").is_file());
    assert!(dir.join("r.1.0.mcr").is_file());

    let chunk = world.get_chunk_without_generation(-1, -1).unwrap();
    assert!(!chunk.read().unwrap().is_modified());

    // A fresh world over the same directory sees the saved blocks, and only reads 
    // regions lazily.
    let world = World::new().with_directory(&dir);
    assert_eq!(world.region_count(), 0);
    assert_eq!(world.get_block(IVec3::new(-1, 64, -1)).unwrap(), Block::new(block::WOOD, 2));
    assert_eq!(world.get_block(IVec3::new(600, 1, 3)).unwrap(), Block::of(block::COBBLESTONE));
    assert_eq!(world.get_block(IVec3::new(-1, 65, -1)).unwrap(), Block::AIR);

    let _ = std::fs::remove_dir_all(&dir);

}

#[test]
fn save_to_copies_stored_chunks() {

    let first = temp_dir("save-from");
    let second = temp_dir("save-to");

    let world = World::new().with_directory(&first);
    world.set_block(IVec3::new(1, 1, 1), Block::of(block::STONE)).unwrap();
    world.set_block(IVec3::new(40, 1, 1), Block::of(block::SAND)).unwrap();
    world.save().unwrap();

    // Only one of the chunks is resident when saving elsewhere.
    let world = World::new().with_directory(&first);
    assert_eq!(world.get_block(IVec3::new(1, 1, 1)).unwrap(), Block::of(block::STONE));
    world.save_to(&second).unwrap();
    assert_eq!(world.directory().as_deref(), Some(second.as_path()));

    let world = World::new().with_directory(&second);
    assert_eq!(world.get_block(IVec3::new(1, 1, 1)).unwrap(), Block::of(block::STONE));
    assert_eq!(world.get_block(IVec3::new(40, 1, 1)).unwrap(), Block::of(block::SAND));

    let _ = std::fs::remove_dir_all(&first);
    let _ = std::fs::remove_dir_all(&second);

}

#[test]
fn unload_chunk() {

    let dir = temp_dir("unload");
    let world = World::new().with_directory(&dir);
    let pos = IVec3::new(20, 30, 20);

    world.set_block(pos, Block::of(block::GRAVEL)).unwrap();
    let chunk = world.get_chunk(1, 1).unwrap();
    assert!(world.unload_chunk(1, 1, true).unwrap());
    assert!(chunk.read().unwrap().region().is_none());
    assert!(world.get_chunk_without_generation(1, 1).is_none());
    assert!(!world.unload_chunk(1, 1, false).unwrap());

    // Saved on unload, so it can be loaded back.
    assert_eq!(world.get_block(pos).unwrap(), Block::of(block::GRAVEL));

    // Unloading without save discards changes.
    world.set_block(pos, Block::AIR).unwrap();
    assert!(world.unload_chunk(1, 1, false).unwrap());
    assert_eq!(world.get_block(pos).unwrap(), Block::of(block::GRAVEL));

    let _ = std::fs::remove_dir_all(&dir);

}

#[test]
fn unload_saves_sibling_chunks() {

    let dir = temp_dir("unload-siblings");
    let world = World::new().with_directory(&dir);
    world.set_block(IVec3::new(1, 10, 1), Block::of(block::STONE)).unwrap();
    world.set_block(IVec3::new(17, 10, 1), Block::of(block::GLASS)).unwrap();

    // Chunks 0/0 and 1/0 share region 0/0, unloading one saves both.
    assert!(world.unload_chunk(0, 0, true).unwrap());

    let reopened = World::new().with_directory(&dir);
    assert_eq!(reopened.get_block(IVec3::new(1, 10, 1)).unwrap(), Block::of(block::STONE));
    assert_eq!(reopened.get_block(IVec3::new(17, 10, 1)).unwrap(), Block::of(block::GLASS));

    let _ = std::fs::remove_dir_all(&dir);

}

#[test]
fn block_write_marks_region_dirty() {

    let dir = temp_dir("dirty");
    let world = World::new().with_directory(&dir);
    let pos = IVec3::new(-3, 64, 5);

    world.set_block(pos, Block::of(block::STONE)).unwrap();
    world.save().unwrap();
    let region = world.get_region(-1, 0).unwrap();
    assert!(!region.is_dirty());

    world.set_block(pos, Block::of(block::DIRT)).unwrap();
    assert!(region.is_dirty());
    world.save().unwrap();
    assert!(!region.is_dirty());

    let _ = std::fs::remove_dir_all(&dir);

}

#[test]
fn falling_body_lands() {

    let world = World::new().with_generator(FlatGenerator::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_ = Arc::clone(&events);
    world.events().subscribe(move |event: &Event| {
        if let Event::Entity { id, inner } = event {
            events_.lock().unwrap().push((*id, inner.clone()));
        }
    });

    let body = FallingBody::new(DVec3::new(0.5, 12.0, 0.5), Block::of(block::SAND));
    assert_eq!(body.pos(), DVec3::new(0.5, 12.0, 0.5));
    let id = world.spawn_entity(Box::new(body));
    assert_eq!(world.entity_ids(), vec![id]);

    for _ in 0..200 {
        world.tick_entities();
        if world.entity_count() == 0 {
            break;
        }
    }

    assert_eq!(world.entity_count(), 0);
    assert_eq!(world.get_block(IVec3::new(0, 4, 0)).unwrap(), Block::of(block::SAND));

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], (i, EntityEvent::Spawn { .. }) if i == id));
    assert!(matches!(events[1], (i, EntityEvent::Remove) if i == id));

}

#[test]
fn entity_ticker_runs() {

    let world = Arc::new(World::new().with_generator(FlatGenerator::default()));
    world.spawn_entity(Box::new(FallingBody::new(DVec3::new(3.5, 6.0, 3.5), Block::of(block::GRAVEL))));

    let ticker = world.start_entity_ticker(Duration::from_millis(5)).unwrap();
    assert!(ticker.is_running());

    let start = std::time::Instant::now();
    while world.entity_count() != 0 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(5));
    }

    drop(ticker);
    assert_eq!(world.entity_count(), 0);
    assert_eq!(world.get_block(IVec3::new(3, 4, 3)).unwrap(), Block::of(block::GRAVEL));

}
