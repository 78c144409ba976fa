mod end_to_end;
mod mirroring;
mod runner_slot;
